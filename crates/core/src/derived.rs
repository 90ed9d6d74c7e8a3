//! Fields computed from a realtime snapshot
//!
//! Derivations read only the values of the batch being installed and never
//! replace a value the source reported itself.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use skyboard_types::{CategoryKey, Measurement, Unit, UnitSystem, ValueType};
use std::collections::HashMap;

use crate::schema::FieldDescriptor;

fn builtin(text: &str) -> CategoryKey {
    CategoryKey::parse(text).expect("valid built-in key")
}

pub static TEMPERATURE: Lazy<CategoryKey> =
    Lazy::new(|| builtin("environment.temperature.temperature"));
pub static HUMIDITY: Lazy<CategoryKey> = Lazy::new(|| builtin("environment.humidity.humidity"));
pub static WIND_SPEED: Lazy<CategoryKey> = Lazy::new(|| builtin("environment.wind.speed"));

pub static DEWPOINT: Lazy<CategoryKey> = Lazy::new(|| builtin("environment.temperature.dewpoint"));
pub static HEAT_INDEX: Lazy<CategoryKey> =
    Lazy::new(|| builtin("environment.temperature.heatIndex"));
pub static WIND_CHILL: Lazy<CategoryKey> =
    Lazy::new(|| builtin("environment.temperature.windChill"));
pub static FEELS_LIKE: Lazy<CategoryKey> =
    Lazy::new(|| builtin("environment.temperature.feelsLike"));

/// Heat index is only meaningful from 80 °F up
const HEAT_INDEX_MIN_C: f64 = 26.7;
/// Wind chill needs cold air and moving air
const WIND_CHILL_MAX_C: f64 = 10.0;
const WIND_CHILL_MIN_KMH: f64 = 4.8;

/// Dew point by the Magnus formula
pub fn dewpoint(temperature_c: f64, humidity: f64) -> Option<f64> {
    if humidity <= 0.0 || humidity > 100.0 {
        return None;
    }
    const A: f64 = 17.625;
    const B: f64 = 243.04;
    let gamma = (humidity / 100.0).ln() + A * temperature_c / (B + temperature_c);
    Some(B * gamma / (A - gamma))
}

/// NWS heat index (Rothfusz regression), `None` below the threshold
pub fn heat_index(temperature_c: f64, humidity: f64) -> Option<f64> {
    if temperature_c < HEAT_INDEX_MIN_C {
        return None;
    }
    let t = Unit::Celsius.convert(temperature_c, Unit::Fahrenheit).ok()?;
    let r = humidity;
    let hi = -42.379 + 2.049_015_23 * t + 10.143_331_27 * r
        - 0.224_755_41 * t * r
        - 0.006_837_83 * t * t
        - 0.054_817_17 * r * r
        + 0.001_228_74 * t * t * r
        + 0.000_852_82 * t * r * r
        - 0.000_001_99 * t * t * r * r;
    Unit::Fahrenheit.convert(hi, Unit::Celsius).ok()
}

/// Environment Canada wind chill, `None` outside its validity range
pub fn wind_chill(temperature_c: f64, wind_kmh: f64) -> Option<f64> {
    if temperature_c > WIND_CHILL_MAX_C || wind_kmh <= WIND_CHILL_MIN_KMH {
        return None;
    }
    let v = wind_kmh.powf(0.16);
    Some(13.12 + 0.6215 * temperature_c - 11.37 * v + 0.3965 * temperature_c * v)
}

fn insert_if_absent(
    values: &mut HashMap<CategoryKey, Measurement>,
    key: &CategoryKey,
    celsius: Option<f64>,
    timestamp: DateTime<Utc>,
    units: UnitSystem,
) {
    if values.contains_key(key) {
        return;
    }
    if let Some(celsius) = celsius {
        let measurement =
            Measurement::number(ValueType::Temperature, celsius, Unit::Celsius, timestamp);
        values.insert(key.clone(), measurement.localize(units));
    }
}

/// Add the derived temperature fields to `values`, using only `values`
pub fn derive(values: &mut HashMap<CategoryKey, Measurement>, units: UnitSystem) {
    let Some(temperature) = values.get(&*TEMPERATURE) else {
        return;
    };
    let timestamp = temperature.timestamp;
    let Some(t) = temperature.value_in(Unit::Celsius) else {
        return;
    };
    let humidity = values.get(&*HUMIDITY).and_then(|m| m.value_in(Unit::Percent));
    let wind = values
        .get(&*WIND_SPEED)
        .and_then(|m| m.value_in(Unit::KilometerPerHour));

    let dew = humidity.and_then(|rh| dewpoint(t, rh));
    let heat = humidity.and_then(|rh| heat_index(t, rh));
    let chill = wind.and_then(|v| wind_chill(t, v));
    let feels = heat.or(chill).unwrap_or(t);

    insert_if_absent(values, &DEWPOINT, dew, timestamp, units);
    insert_if_absent(values, &HEAT_INDEX, heat, timestamp, units);
    insert_if_absent(values, &WIND_CHILL, chill, timestamp, units);
    insert_if_absent(values, &FEELS_LIKE, Some(feels), timestamp, units);
}

/// Descriptors for the derived keys, registered alongside source schemas
pub fn descriptors() -> Vec<FieldDescriptor> {
    [
        (&*DEWPOINT, "Dew Point"),
        (&*HEAT_INDEX, "Heat Index"),
        (&*WIND_CHILL, "Wind Chill"),
        (&*FEELS_LIKE, "Feels Like"),
    ]
    .into_iter()
    .map(|(key, title)| FieldDescriptor {
        key: key.clone(),
        source_keys: Vec::new(),
        source_unit: Some("c".to_string()),
        value_type: ValueType::Temperature,
        title: title.to_string(),
        alias: HashMap::new(),
        format: None,
        timezone: None,
        accumulate: false,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value_type: ValueType, value: f64, unit: Unit) -> Measurement {
        Measurement::number(value_type, value, unit, Utc::now())
    }

    #[test]
    fn test_dewpoint_magnus() {
        let td = dewpoint(20.0, 50.0).unwrap();
        assert!((td - 9.26).abs() < 0.05, "got {td}");
        assert!(dewpoint(20.0, 0.0).is_none());
    }

    #[test]
    fn test_heat_index_threshold() {
        assert!(heat_index(20.0, 80.0).is_none());
        let hi = heat_index(32.0, 70.0).unwrap();
        assert!(hi > 32.0);
    }

    #[test]
    fn test_wind_chill_range() {
        assert!(wind_chill(15.0, 20.0).is_none());
        assert!(wind_chill(-5.0, 3.0).is_none());
        let wc = wind_chill(-5.0, 20.0).unwrap();
        assert!((wc - -11.6).abs() < 0.1, "got {wc}");
    }

    #[test]
    fn test_derive_fills_missing_only() {
        let mut values = HashMap::new();
        values.insert(TEMPERATURE.clone(), reading(ValueType::Temperature, -5.0, Unit::Celsius));
        values.insert(HUMIDITY.clone(), reading(ValueType::Humidity, 60.0, Unit::Percent));
        values.insert(WIND_SPEED.clone(), reading(ValueType::Speed, 20.0, Unit::KilometerPerHour));
        values.insert(DEWPOINT.clone(), reading(ValueType::Temperature, 1.0, Unit::Celsius));

        derive(&mut values, UnitSystem::Metric);

        assert_eq!(values[&*DEWPOINT].as_f64(), Some(1.0));
        assert!(values.contains_key(&*WIND_CHILL));
        assert!(!values.contains_key(&*HEAT_INDEX));
        assert_eq!(values[&*FEELS_LIKE].as_f64(), values[&*WIND_CHILL].as_f64());
    }

    #[test]
    fn test_derive_in_imperial() {
        let mut values = HashMap::new();
        values.insert(
            TEMPERATURE.clone(),
            reading(ValueType::Temperature, 50.0, Unit::Fahrenheit),
        );
        derive(&mut values, UnitSystem::Imperial);
        let feels = &values[&*FEELS_LIKE];
        assert_eq!(feels.unit, Unit::Fahrenheit);
        assert!((feels.as_f64().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_temperature_no_derivation() {
        let mut values = HashMap::new();
        values.insert(HUMIDITY.clone(), reading(ValueType::Humidity, 60.0, Unit::Percent));
        derive(&mut values, UnitSystem::Metric);
        assert_eq!(values.len(), 1);
    }
}
