//! Value types, physical units and display unit systems
//!
//! Every scalar unit belongs to a [`Dimension`] and converts affinely to that
//! dimension's base unit (°C, hPa, m/s, mm, s, degrees, ...). Sources declare
//! the unit their raw numbers are in; the engine converts to the unit chosen
//! by the active [`UnitSystem`] before publishing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unit parsing / conversion failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error("unknown unit '{0}'")]
    Unknown(String),
    #[error("unknown value type '{0}'")]
    UnknownValueType(String),
    #[error("cannot convert {from} to {to}")]
    Incompatible { from: Unit, to: Unit },
}

/// Semantic type of a field, drives how a raw value is converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    Temperature,
    Pressure,
    Speed,
    Length,
    /// Composite numerator/denominator value, e.g. rain in mm per minute
    PrecipitationRate,
    Humidity,
    Percentage,
    Direction,
    Illuminance,
    Irradiance,
    Voltage,
    Count,
    Number,
    Datetime,
    Timedelta,
    Enumeration,
    Glyph,
    Text,
}

impl ValueType {
    /// Dimension of the measured quantity, `None` for non-physical types
    pub fn dimension(self) -> Option<Dimension> {
        match self {
            ValueType::Temperature => Some(Dimension::Temperature),
            ValueType::Pressure => Some(Dimension::Pressure),
            ValueType::Speed => Some(Dimension::Speed),
            ValueType::Length => Some(Dimension::Length),
            ValueType::PrecipitationRate => Some(Dimension::Length),
            ValueType::Humidity | ValueType::Percentage => Some(Dimension::Ratio),
            ValueType::Direction => Some(Dimension::Angle),
            ValueType::Illuminance => Some(Dimension::Illuminance),
            ValueType::Irradiance => Some(Dimension::Irradiance),
            ValueType::Voltage => Some(Dimension::Voltage),
            ValueType::Timedelta => Some(Dimension::Time),
            ValueType::Count
            | ValueType::Number
            | ValueType::Datetime
            | ValueType::Enumeration
            | ValueType::Glyph
            | ValueType::Text => None,
        }
    }

    /// Whether a field of this type cannot be interpreted without a `sourceUnit`
    pub fn requires_source_unit(self) -> bool {
        self.dimension().is_some() || self == ValueType::Datetime
    }

    /// Number-valued scalar with a physical unit
    pub fn is_scalar(self) -> bool {
        self.dimension().is_some()
            && !matches!(self, ValueType::PrecipitationRate | ValueType::Timedelta)
    }
}

impl FromStr for ValueType {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value_type = match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => ValueType::Temperature,
            "pressure" => ValueType::Pressure,
            "speed" | "wind" => ValueType::Speed,
            "length" | "distance" | "precipitation" => ValueType::Length,
            "precipitationrate" | "rate" => ValueType::PrecipitationRate,
            "humidity" => ValueType::Humidity,
            "percentage" | "percent" => ValueType::Percentage,
            "direction" | "angle" => ValueType::Direction,
            "illuminance" | "light" => ValueType::Illuminance,
            "irradiance" => ValueType::Irradiance,
            "voltage" => ValueType::Voltage,
            "count" | "int" => ValueType::Count,
            "number" | "float" => ValueType::Number,
            "datetime" => ValueType::Datetime,
            "timedelta" | "duration" => ValueType::Timedelta,
            "enumeration" | "enum" => ValueType::Enumeration,
            "glyph" | "icon" => ValueType::Glyph,
            "text" | "str" | "string" => ValueType::Text,
            _ => return Err(UnitError::UnknownValueType(s.to_string())),
        };
        Ok(value_type)
    }
}

/// Physical dimension shared by convertible units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Temperature,
    Pressure,
    Speed,
    Length,
    Time,
    Angle,
    Illuminance,
    Irradiance,
    Voltage,
    Ratio,
    Dimensionless,
}

/// Measurement unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Kelvin,
    Hectopascal,
    Millibar,
    Kilopascal,
    InchMercury,
    MillimeterMercury,
    MeterPerSecond,
    KilometerPerHour,
    MilePerHour,
    Knot,
    FootPerSecond,
    Millimeter,
    Centimeter,
    Meter,
    Kilometer,
    Inch,
    Foot,
    Mile,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Degree,
    Radian,
    Lux,
    WattPerSquareMeter,
    Volt,
    Millivolt,
    Percent,
    Fraction,
    None,
}

impl Unit {
    pub fn dimension(self) -> Dimension {
        use Unit as U;
        match self {
            U::Celsius | U::Fahrenheit | U::Kelvin => Dimension::Temperature,
            U::Hectopascal | U::Millibar | U::Kilopascal | U::InchMercury | U::MillimeterMercury => {
                Dimension::Pressure
            }
            U::MeterPerSecond | U::KilometerPerHour | U::MilePerHour | U::Knot | U::FootPerSecond => {
                Dimension::Speed
            }
            U::Millimeter | U::Centimeter | U::Meter | U::Kilometer | U::Inch | U::Foot | U::Mile => {
                Dimension::Length
            }
            U::Millisecond | U::Second | U::Minute | U::Hour | U::Day => Dimension::Time,
            U::Degree | U::Radian => Dimension::Angle,
            U::Lux => Dimension::Illuminance,
            U::WattPerSquareMeter => Dimension::Irradiance,
            U::Volt | U::Millivolt => Dimension::Voltage,
            U::Percent | U::Fraction => Dimension::Ratio,
            U::None => Dimension::Dimensionless,
        }
    }

    /// Display symbol
    pub fn symbol(self) -> &'static str {
        use Unit as U;
        match self {
            U::Celsius => "°C",
            U::Fahrenheit => "°F",
            U::Kelvin => "K",
            U::Hectopascal => "hPa",
            U::Millibar => "mb",
            U::Kilopascal => "kPa",
            U::InchMercury => "inHg",
            U::MillimeterMercury => "mmHg",
            U::MeterPerSecond => "m/s",
            U::KilometerPerHour => "km/h",
            U::MilePerHour => "mph",
            U::Knot => "kn",
            U::FootPerSecond => "ft/s",
            U::Millimeter => "mm",
            U::Centimeter => "cm",
            U::Meter => "m",
            U::Kilometer => "km",
            U::Inch => "in",
            U::Foot => "ft",
            U::Mile => "mi",
            U::Millisecond => "ms",
            U::Second => "s",
            U::Minute => "min",
            U::Hour => "h",
            U::Day => "d",
            U::Degree => "°",
            U::Radian => "rad",
            U::Lux => "lx",
            U::WattPerSquareMeter => "W/m²",
            U::Volt => "V",
            U::Millivolt => "mV",
            U::Percent => "%",
            U::Fraction => "",
            U::None => "",
        }
    }

    /// `(scale, offset)` such that `base = value * scale + offset`
    fn to_base_factors(self) -> (f64, f64) {
        use Unit as U;
        match self {
            U::Celsius => (1.0, 0.0),
            U::Fahrenheit => (5.0 / 9.0, -32.0 * 5.0 / 9.0),
            U::Kelvin => (1.0, -273.15),
            U::Hectopascal | U::Millibar => (1.0, 0.0),
            U::Kilopascal => (10.0, 0.0),
            U::InchMercury => (33.863_886, 0.0),
            U::MillimeterMercury => (1.333_224, 0.0),
            U::MeterPerSecond => (1.0, 0.0),
            U::KilometerPerHour => (1.0 / 3.6, 0.0),
            U::MilePerHour => (0.447_04, 0.0),
            U::Knot => (0.514_444, 0.0),
            U::FootPerSecond => (0.3048, 0.0),
            U::Millimeter => (1.0, 0.0),
            U::Centimeter => (10.0, 0.0),
            U::Meter => (1_000.0, 0.0),
            U::Kilometer => (1_000_000.0, 0.0),
            U::Inch => (25.4, 0.0),
            U::Foot => (304.8, 0.0),
            U::Mile => (1_609_344.0, 0.0),
            U::Millisecond => (0.001, 0.0),
            U::Second => (1.0, 0.0),
            U::Minute => (60.0, 0.0),
            U::Hour => (3_600.0, 0.0),
            U::Day => (86_400.0, 0.0),
            U::Degree => (1.0, 0.0),
            U::Radian => (180.0 / std::f64::consts::PI, 0.0),
            U::Lux | U::WattPerSquareMeter | U::Volt => (1.0, 0.0),
            U::Millivolt => (0.001, 0.0),
            U::Percent => (1.0, 0.0),
            U::Fraction => (100.0, 0.0),
            U::None => (1.0, 0.0),
        }
    }

    pub fn to_base(self, value: f64) -> f64 {
        let (scale, offset) = self.to_base_factors();
        value * scale + offset
    }

    pub fn from_base(self, value: f64) -> f64 {
        let (scale, offset) = self.to_base_factors();
        (value - offset) / scale
    }

    /// Convert `value` from `self` to `target`
    pub fn convert(self, value: f64, target: Unit) -> Result<f64, UnitError> {
        if self == target {
            return Ok(value);
        }
        if self.dimension() != target.dimension() {
            return Err(UnitError::Incompatible {
                from: self,
                to: target,
            });
        }
        Ok(target.from_base(self.to_base(value)))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Unit as U;
        let trimmed = s.trim();
        if trimmed == "°" {
            return Ok(U::Degree);
        }
        let normalized = trimmed.to_ascii_lowercase().replace('°', "").replace(' ', "");
        let unit = match normalized.as_str() {
            "c" | "degc" | "celsius" => U::Celsius,
            "f" | "degf" | "fahrenheit" => U::Fahrenheit,
            "k" | "kelvin" => U::Kelvin,
            "hpa" | "hectopascal" => U::Hectopascal,
            "mb" | "mbar" | "millibar" => U::Millibar,
            "kpa" => U::Kilopascal,
            "inhg" => U::InchMercury,
            "mmhg" => U::MillimeterMercury,
            "m/s" | "mps" | "ms-1" => U::MeterPerSecond,
            "km/h" | "kmh" | "kph" => U::KilometerPerHour,
            "mph" | "mi/h" => U::MilePerHour,
            "kn" | "kt" | "knot" | "knots" => U::Knot,
            "ft/s" | "fps" => U::FootPerSecond,
            "mm" => U::Millimeter,
            "cm" => U::Centimeter,
            "m" => U::Meter,
            "km" => U::Kilometer,
            "in" | "inch" => U::Inch,
            "ft" | "foot" => U::Foot,
            "mi" | "mile" => U::Mile,
            "ms" | "millisecond" => U::Millisecond,
            "s" | "sec" | "second" => U::Second,
            "min" | "minute" => U::Minute,
            "h" | "hr" | "hour" => U::Hour,
            "d" | "day" => U::Day,
            "deg" | "degree" | "degrees" => U::Degree,
            "rad" | "radian" => U::Radian,
            "lx" | "lux" => U::Lux,
            "w/m2" | "w/m²" | "wm2" => U::WattPerSquareMeter,
            "v" | "volt" => U::Volt,
            "mv" => U::Millivolt,
            "%" | "percent" => U::Percent,
            "fraction" | "ratio" => U::Fraction,
            "" | "none" => U::None,
            _ => return Err(UnitError::Unknown(s.to_string())),
        };
        Ok(unit)
    }
}

/// Display unit system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl UnitSystem {
    /// Unit values of `dimension` are shown in
    pub fn display_unit(self, dimension: Dimension) -> Unit {
        match (self, dimension) {
            (UnitSystem::Metric, Dimension::Temperature) => Unit::Celsius,
            (UnitSystem::Imperial, Dimension::Temperature) => Unit::Fahrenheit,
            (UnitSystem::Metric, Dimension::Pressure) => Unit::Hectopascal,
            (UnitSystem::Imperial, Dimension::Pressure) => Unit::InchMercury,
            (UnitSystem::Metric, Dimension::Speed) => Unit::MeterPerSecond,
            (UnitSystem::Imperial, Dimension::Speed) => Unit::MilePerHour,
            (UnitSystem::Metric, Dimension::Length) => Unit::Millimeter,
            (UnitSystem::Imperial, Dimension::Length) => Unit::Inch,
            (_, Dimension::Time) => Unit::Second,
            (_, Dimension::Angle) => Unit::Degree,
            (_, Dimension::Illuminance) => Unit::Lux,
            (_, Dimension::Irradiance) => Unit::WattPerSquareMeter,
            (_, Dimension::Voltage) => Unit::Volt,
            (_, Dimension::Ratio) => Unit::Percent,
            (_, Dimension::Dimensionless) => Unit::None,
        }
    }
}

impl FromStr for UnitSystem {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metric" | "si" => Ok(UnitSystem::Metric),
            "imperial" | "us" => Ok(UnitSystem::Imperial),
            _ => Err(UnitError::Unknown(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_temperature_conversion_is_affine() {
        assert!(close(Unit::Celsius.convert(100.0, Unit::Fahrenheit).unwrap(), 212.0));
        assert!(close(Unit::Fahrenheit.convert(32.0, Unit::Celsius).unwrap(), 0.0));
        assert!(close(Unit::Kelvin.convert(273.15, Unit::Celsius).unwrap(), 0.0));
    }

    #[test]
    fn test_pressure_and_speed() {
        assert!(close(Unit::InchMercury.convert(1.0, Unit::Hectopascal).unwrap(), 33.8639));
        assert!(close(Unit::KilometerPerHour.convert(36.0, Unit::MeterPerSecond).unwrap(), 10.0));
    }

    #[test]
    fn test_incompatible_dimensions() {
        assert!(matches!(
            Unit::Celsius.convert(1.0, Unit::Hectopascal),
            Err(UnitError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_unit_aliases() {
        assert_eq!("°C".parse::<Unit>().unwrap(), Unit::Celsius);
        assert_eq!("°".parse::<Unit>().unwrap(), Unit::Degree);
        assert_eq!(" ° ".parse::<Unit>().unwrap(), Unit::Degree);
        assert_eq!("".parse::<Unit>().unwrap(), Unit::None);
        assert_eq!("inHg".parse::<Unit>().unwrap(), Unit::InchMercury);
        assert_eq!("km/h".parse::<Unit>().unwrap(), Unit::KilometerPerHour);
        assert!("furlongs".parse::<Unit>().is_err());
    }

    #[test]
    fn test_value_type_requirements() {
        assert!(ValueType::Temperature.requires_source_unit());
        assert!(ValueType::Datetime.requires_source_unit());
        assert!(!ValueType::Enumeration.requires_source_unit());
        assert!(!ValueType::PrecipitationRate.is_scalar());
        assert_eq!("dateTime".parse::<ValueType>().unwrap(), ValueType::Datetime);
    }

    #[test]
    fn test_display_units() {
        assert_eq!(
            UnitSystem::Imperial.display_unit(Dimension::Temperature),
            Unit::Fahrenheit
        );
        assert_eq!(UnitSystem::Metric.display_unit(Dimension::Pressure), Unit::Hectopascal);
    }
}
