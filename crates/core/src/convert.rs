//! Raw value conversion
//!
//! Turns one raw JSON value into a [`Measurement`] according to a resolved
//! [`FieldDescriptor`]: numbers get their declared unit and are localized,
//! rates are built from two components, times and durations are parsed by
//! the declared `sourceUnit` convention, enumerations go through the alias
//! table.

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use skyboard_types::{Measurement, Unit, UnitSystem, ValueType};

use crate::error::ConversionError;
use crate::schema::FieldDescriptor;

/// `P[nW][nD][T[nH][nM][nS]]`, fractional components allowed
static ISO_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^P(?:(\d+(?:\.\d+)?)W)?(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("Invalid regex")
});

fn describe(raw: &Value) -> String {
    match raw {
        Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}

fn number(raw: &Value) -> Result<f64, ConversionError> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ConversionError::UnexpectedValue {
        expected: "a number",
        found: describe(raw),
    })
}

fn text(raw: &Value) -> Result<String, ConversionError> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) => Ok(raw.to_string()),
        other => Err(ConversionError::UnexpectedValue {
            expected: "a scalar",
            found: describe(other),
        }),
    }
}

fn source_unit(descriptor: &FieldDescriptor) -> Result<&str, ConversionError> {
    descriptor.source_unit.as_deref().ok_or_else(|| {
        ConversionError::Schema(crate::error::SchemaError::ValueNotFound {
            key: descriptor.key.clone(),
            missing: "sourceUnit",
        })
    })
}

fn timezone(descriptor: &FieldDescriptor) -> Result<Tz, ConversionError> {
    match descriptor.timezone.as_deref() {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ConversionError::UnknownTimezone(name.to_string())),
    }
}

/// Convert `raw` as described by `descriptor`, stamped with `timestamp`
pub fn convert(
    descriptor: &FieldDescriptor,
    raw: &Value,
    timestamp: DateTime<Utc>,
    units: UnitSystem,
) -> Result<Measurement, ConversionError> {
    if raw.is_null() {
        return Err(ConversionError::UnexpectedValue {
            expected: "a value",
            found: "null".to_string(),
        });
    }

    let measurement = match descriptor.value_type {
        ValueType::PrecipitationRate => rate(descriptor, raw, timestamp)?,
        ValueType::Timedelta => {
            Measurement::duration(duration(source_unit(descriptor)?, raw)?, timestamp)
        }
        ValueType::Datetime => {
            Measurement::time(datetime(descriptor, raw, timestamp)?, timestamp)
        }
        ValueType::Count | ValueType::Number => {
            Measurement::number(descriptor.value_type, number(raw)?, Unit::None, timestamp)
        }
        ValueType::Enumeration | ValueType::Glyph => {
            let raw_text = text(raw)?;
            let shown = descriptor.alias.get(&raw_text).cloned().unwrap_or(raw_text);
            Measurement::text(descriptor.value_type, shown, timestamp)
        }
        ValueType::Text => Measurement::text(ValueType::Text, text(raw)?, timestamp),
        scalar => {
            let unit: Unit = source_unit(descriptor)?.parse()?;
            Measurement::number(scalar, number(raw)?, unit, timestamp)
        }
    };
    Ok(measurement.localize(units))
}

/// Composite numerator/denominator value, e.g. `mm/min`
fn rate(
    descriptor: &FieldDescriptor,
    raw: &Value,
    timestamp: DateTime<Utc>,
) -> Result<Measurement, ConversionError> {
    let declared = source_unit(descriptor)?;
    let (numerator_unit, per) = match declared.split_once('/') {
        Some((numerator, denominator)) => (numerator.parse::<Unit>()?, denominator.parse::<Unit>()?),
        None => (declared.parse::<Unit>()?, Unit::Hour),
    };

    let (numerator, denominator) = match raw {
        Value::Array(parts) => {
            let numerator = parts.first().ok_or(ConversionError::MissingComponent("numerator"))?;
            let denominator = parts.get(1).ok_or(ConversionError::MissingComponent("denominator"))?;
            (number(numerator)?, number(denominator)?)
        }
        Value::Object(parts) => {
            let numerator = parts
                .get("numerator")
                .ok_or(ConversionError::MissingComponent("numerator"))?;
            let denominator = parts
                .get("denominator")
                .ok_or(ConversionError::MissingComponent("denominator"))?;
            (number(numerator)?, number(denominator)?)
        }
        other => (number(other)?, 1.0),
    };

    Ok(Measurement::rate(numerator, numerator_unit, denominator, per, timestamp))
}

/// Seconds, from an ISO-8601 duration or a number in a time unit
fn duration(convention: &str, raw: &Value) -> Result<f64, ConversionError> {
    match convention.to_ascii_lowercase().as_str() {
        "iso" | "iso8601" | "iso-8601" => {
            let text = raw.as_str().ok_or_else(|| ConversionError::UnexpectedValue {
                expected: "an ISO-8601 duration",
                found: describe(raw),
            })?;
            parse_iso_duration(text)
        }
        unit => {
            let unit: Unit = unit.parse()?;
            Ok(unit.convert(number(raw)?, Unit::Second)?)
        }
    }
}

/// Parse `PT1H30M`-style durations into seconds
pub fn parse_iso_duration(text: &str) -> Result<f64, ConversionError> {
    let bad = || ConversionError::BadDuration(text.to_string());
    let captures = ISO_DURATION.captures(text.trim()).ok_or_else(bad)?;

    const SCALES: [f64; 5] = [604_800.0, 86_400.0, 3_600.0, 60.0, 1.0];
    let mut seconds = 0.0;
    let mut any = false;
    for (index, scale) in SCALES.iter().enumerate() {
        if let Some(component) = captures.get(index + 1) {
            seconds += component.as_str().parse::<f64>().map_err(|_| bad())? * scale;
            any = true;
        }
    }
    if any {
        Ok(seconds)
    } else {
        Err(bad())
    }
}

fn datetime(
    descriptor: &FieldDescriptor,
    raw: &Value,
    timestamp: DateTime<Utc>,
) -> Result<DateTime<Utc>, ConversionError> {
    let convention = source_unit(descriptor)?;
    let bad = || ConversionError::BadTimestamp {
        value: describe(raw),
        convention: convention.to_string(),
    };

    match convention.to_ascii_lowercase().as_str() {
        "epoch" | "s" | "unix" => {
            let seconds = number(raw)?;
            DateTime::from_timestamp_millis((seconds * 1_000.0).round() as i64).ok_or_else(bad)
        }
        "epochms" | "ms" => {
            DateTime::from_timestamp_millis(number(raw)?.round() as i64).ok_or_else(bad)
        }
        "iso" | "iso8601" | "rfc3339" => {
            let text = raw.as_str().ok_or_else(bad)?;
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(parsed.with_timezone(&Utc));
            }
            let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .map_err(|_| bad())?;
            localize_naive(naive, timezone(descriptor)?).ok_or_else(bad)
        }
        _ => {
            let text = text(raw)?;
            strftime(&text, convention, timezone(descriptor)?, timestamp).ok_or_else(bad)
        }
    }
}

fn localize_naive(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Explicit format. A format carrying only a time of day is placed on the
/// local date of `reference`.
fn strftime(text: &str, format: &str, tz: Tz, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_str(text, format) {
        return Some(with_offset.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
        return localize_naive(naive, tz);
    }
    let time = NaiveTime::parse_from_str(text, format).ok()?;
    let date = reference.with_timezone(&tz).date_naive();
    localize_naive(date.and_time(time), tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyboard_types::{CategoryKey, Value as Converted};
    use std::collections::HashMap;

    fn descriptor(value_type: ValueType, unit: Option<&str>) -> FieldDescriptor {
        FieldDescriptor {
            key: CategoryKey::parse("test.field").unwrap(),
            source_keys: vec!["field".to_string()],
            source_unit: unit.map(str::to_string),
            value_type,
            title: "Field".to_string(),
            alias: HashMap::new(),
            format: None,
            timezone: None,
            accumulate: false,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_scalar_is_localized() {
        let now = Utc::now();
        let d = descriptor(ValueType::Temperature, Some("f"));
        let m = convert(&d, &json!(212.0), now, UnitSystem::Metric).unwrap();
        assert_eq!(m.unit, Unit::Celsius);
        assert!(close(m.as_f64().unwrap(), 100.0));

        let from_text = convert(&d, &json!(" 32 "), now, UnitSystem::Metric).unwrap();
        assert!(close(from_text.as_f64().unwrap(), 0.0));
    }

    #[test]
    fn test_rate_components() {
        let now = Utc::now();
        let d = descriptor(ValueType::PrecipitationRate, Some("mm/min"));
        let from_pair = convert(&d, &json!([3.0, 2.0]), now, UnitSystem::Metric).unwrap();
        assert!(close(from_pair.as_f64().unwrap(), 90.0));
        assert_eq!(from_pair.per, Some(Unit::Hour));

        let from_object = convert(
            &d,
            &json!({ "numerator": 1.0, "denominator": 1.0 }),
            now,
            UnitSystem::Metric,
        )
        .unwrap();
        assert!(close(from_object.as_f64().unwrap(), 60.0));

        assert!(matches!(
            convert(&d, &json!({ "numerator": 1.0 }), now, UnitSystem::Metric),
            Err(ConversionError::MissingComponent("denominator"))
        ));
    }

    #[test]
    fn test_iso_duration() {
        assert!(close(parse_iso_duration("PT1H30M").unwrap(), 5_400.0));
        assert!(close(parse_iso_duration("P1DT0.5S").unwrap(), 86_400.5));
        assert!(close(parse_iso_duration("P1W").unwrap(), 604_800.0));
        assert!(parse_iso_duration("P").is_err());
        assert!(parse_iso_duration("1 hour").is_err());
    }

    #[test]
    fn test_timedelta_in_minutes() {
        let d = descriptor(ValueType::Timedelta, Some("min"));
        let m = convert(&d, &json!(2), Utc::now(), UnitSystem::Metric).unwrap();
        assert_eq!(m.value, Converted::Duration(120.0));
    }

    #[test]
    fn test_datetime_conventions() {
        let now = Utc::now();
        let epoch = descriptor(ValueType::Datetime, Some("epoch"));
        let m = convert(&epoch, &json!(1_700_000_000), now, UnitSystem::Metric).unwrap();
        assert_eq!(m.value.as_time().unwrap().timestamp(), 1_700_000_000);

        let millis = descriptor(ValueType::Datetime, Some("epochms"));
        let m = convert(&millis, &json!(1_700_000_000_500i64), now, UnitSystem::Metric).unwrap();
        assert_eq!(m.value.as_time().unwrap().timestamp_millis(), 1_700_000_000_500);

        let iso = descriptor(ValueType::Datetime, Some("iso"));
        let m = convert(&iso, &json!("2024-03-01T12:00:00+01:00"), now, UnitSystem::Metric).unwrap();
        assert_eq!(m.value.as_time().unwrap().to_rfc3339(), "2024-03-01T11:00:00+00:00");
    }

    #[test]
    fn test_strftime_with_timezone() {
        let mut d = descriptor(ValueType::Datetime, Some("%Y-%m-%d %H:%M"));
        d.timezone = Some("Europe/Berlin".to_string());
        let m = convert(&d, &json!("2024-01-15 13:00"), Utc::now(), UnitSystem::Metric).unwrap();
        assert_eq!(m.value.as_time().unwrap().to_rfc3339(), "2024-01-15T12:00:00+00:00");

        d.timezone = Some("Mars/Olympus".to_string());
        assert!(matches!(
            convert(&d, &json!("2024-01-15 13:00"), Utc::now(), UnitSystem::Metric),
            Err(ConversionError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_time_of_day_uses_reference_date() {
        let reference = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let d = descriptor(ValueType::Datetime, Some("%H:%M"));
        let m = convert(&d, &json!("05:42"), reference, UnitSystem::Metric).unwrap();
        assert_eq!(m.value.as_time().unwrap().to_rfc3339(), "2024-06-01T05:42:00+00:00");
    }

    #[test]
    fn test_enumeration_alias_passthrough() {
        let mut d = descriptor(ValueType::Enumeration, None);
        d.alias.insert("1".to_string(), "Rain".to_string());
        let now = Utc::now();
        let known = convert(&d, &json!(1), now, UnitSystem::Metric).unwrap();
        assert_eq!(known.value.as_text(), Some("Rain"));
        let unknown = convert(&d, &json!("hail"), now, UnitSystem::Metric).unwrap();
        assert_eq!(unknown.value.as_text(), Some("hail"));
    }

    #[test]
    fn test_bad_values() {
        let now = Utc::now();
        let d = descriptor(ValueType::Pressure, Some("mb"));
        assert!(matches!(
            convert(&d, &json!("n/a"), now, UnitSystem::Metric),
            Err(ConversionError::UnexpectedValue { .. })
        ));
        assert!(convert(&d, &Value::Null, now, UnitSystem::Metric).is_err());

        let unknown_unit = descriptor(ValueType::Pressure, Some("furlongs"));
        assert!(matches!(
            convert(&unknown_unit, &json!(1.0), now, UnitSystem::Metric),
            Err(ConversionError::Unit(_))
        ));
    }
}
