//! Converted measurement values
//!
//! A `Measurement` is what a source contributes for one key in one update:
//! the converted value, its unit, its semantic type and the time it was taken.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::units::{Dimension, Unit, UnitSystem, ValueType};

/// Converted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Number(f64),
    /// Composite value; `numerator` per `denominator` units of the measurement
    Rate { numerator: f64, denominator: f64 },
    Time(DateTime<Utc>),
    /// Elapsed time in seconds
    Duration(f64),
    Text(String),
}

impl Value {
    /// Numeric view: plain numbers, rates as a quotient, durations in seconds
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) | Value::Duration(v) => Some(*v),
            Value::Rate {
                numerator,
                denominator,
            } if *denominator != 0.0 => Some(numerator / denominator),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// One converted value with its unit and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: Value,
    pub value_type: ValueType,
    /// Unit of `value`; for rates, the numerator unit
    pub unit: Unit,
    /// Denominator unit of a rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per: Option<Unit>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Numeric measurement in `unit`
    pub fn number(value_type: ValueType, value: f64, unit: Unit, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Value::Number(value),
            value_type,
            unit,
            per: None,
            timestamp,
        }
    }

    /// Rate measurement, `numerator` in `unit` per `denominator` in `per`
    pub fn rate(
        numerator: f64,
        unit: Unit,
        denominator: f64,
        per: Unit,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            value: Value::Rate {
                numerator,
                denominator,
            },
            value_type: ValueType::PrecipitationRate,
            unit,
            per: Some(per),
            timestamp,
        }
    }

    pub fn text(value_type: ValueType, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Value::Text(text.into()),
            value_type,
            unit: Unit::None,
            per: None,
            timestamp,
        }
    }

    pub fn time(time: DateTime<Utc>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Value::Time(time),
            value_type: ValueType::Datetime,
            unit: Unit::None,
            per: None,
            timestamp,
        }
    }

    pub fn duration(seconds: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Value::Duration(seconds),
            value_type: ValueType::Timedelta,
            unit: Unit::Second,
            per: None,
            timestamp,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Numeric value expressed in `target`, if convertible
    pub fn value_in(&self, target: Unit) -> Option<f64> {
        match &self.value {
            Value::Number(v) => self.unit.convert(*v, target).ok(),
            _ => None,
        }
    }

    /// Convert to the units `system` displays.
    ///
    /// Rates are normalised to a per-hour value. Non-physical values are
    /// returned unchanged.
    pub fn localize(&self, system: UnitSystem) -> Measurement {
        match (&self.value, self.unit.dimension()) {
            (Value::Number(v), dimension) if dimension != Dimension::Dimensionless => {
                let target = system.display_unit(dimension);
                match self.unit.convert(*v, target) {
                    Ok(converted) => Measurement {
                        value: Value::Number(converted),
                        unit: target,
                        ..self.clone()
                    },
                    Err(_) => self.clone(),
                }
            }
            (
                Value::Rate {
                    numerator,
                    denominator,
                },
                dimension,
            ) => {
                let target = system.display_unit(dimension);
                let per = self.per.unwrap_or(Unit::Hour);
                let converted = self
                    .unit
                    .convert(*numerator, target)
                    .and_then(|n| per.convert(*denominator, Unit::Hour).map(|d| (n, d)));
                match converted {
                    Ok((n, d)) if d != 0.0 => Measurement {
                        value: Value::Rate {
                            numerator: n / d,
                            denominator: 1.0,
                        },
                        unit: target,
                        per: Some(Unit::Hour),
                        ..self.clone()
                    },
                    _ => self.clone(),
                }
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Number(v) => {
                let symbol = self.unit.symbol();
                if symbol.is_empty() {
                    write!(f, "{:.1}", v)
                } else if self.unit == Unit::Degree || self.unit == Unit::Percent {
                    write!(f, "{:.1}{}", v, symbol)
                } else {
                    write!(f, "{:.1} {}", v, symbol)
                }
            }
            Value::Rate { .. } => {
                let per = self.per.map(|u| u.symbol()).unwrap_or("h");
                write!(
                    f,
                    "{:.2} {}/{}",
                    self.value.as_f64().unwrap_or_default(),
                    self.unit.symbol(),
                    per
                )
            }
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Duration(secs) => write!(f, "{:.0} s", secs),
            Value::Text(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localize_temperature() {
        let now = Utc::now();
        let m = Measurement::number(ValueType::Temperature, 20.0, Unit::Celsius, now);
        let imperial = m.localize(UnitSystem::Imperial);
        assert_eq!(imperial.unit, Unit::Fahrenheit);
        assert!((imperial.as_f64().unwrap() - 68.0).abs() < 1e-9);
        assert_eq!(imperial.timestamp, now);
    }

    #[test]
    fn test_localize_rate_per_hour() {
        let m = Measurement::rate(1.0, Unit::Millimeter, 1.0, Unit::Minute, Utc::now());
        let local = m.localize(UnitSystem::Metric);
        assert_eq!(local.per, Some(Unit::Hour));
        assert!((local.as_f64().unwrap() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_text_is_unchanged() {
        let m = Measurement::text(ValueType::Enumeration, "Rain", Utc::now());
        assert_eq!(m.localize(UnitSystem::Imperial), m);
        assert_eq!(m.to_string(), "Rain");
    }

    #[test]
    fn test_display_number() {
        let m = Measurement::number(ValueType::Pressure, 1013.31, Unit::Hectopascal, Utc::now());
        assert_eq!(m.to_string(), "1013.3 hPa");
    }
}
