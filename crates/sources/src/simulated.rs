//! Simulated weather station
//!
//! Produces plausible realtime observations and an hourly forecast from a
//! seeded generator, so the whole engine can run without hardware. Values
//! follow a daily cycle in the configured time zone with a little noise.

use anyhow::{anyhow, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use skyboard_core::{DataSource, SourceMetadata};
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Duration;

/// Number of hourly forecast records produced per refresh
const FORECAST_HOURS: i64 = 24;

/// Condition codes and how they are shown
const CONDITIONS: &[(&str, &str)] = &[
    ("clear", "Clear"),
    ("partly-cloudy", "Partly Cloudy"),
    ("cloudy", "Cloudy"),
    ("rainy", "Rain"),
    ("thunderstorm", "Thunderstorm"),
];

/// Configuration for the simulated station
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Generator seed; equal seeds give equal sequences
    pub seed: u64,
    /// Named time zone the daily cycle follows
    pub timezone: String,
    /// Daily mean temperature in °C
    pub mean_temperature: f64,
    /// Half the daily temperature swing in °C
    pub temperature_swing: f64,
    /// Mean station pressure in hPa
    pub mean_pressure: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            timezone: "UTC".to_string(),
            mean_temperature: 15.0,
            temperature_swing: 6.0,
            mean_pressure: 1012.0,
        }
    }
}

/// Simulated weather station
pub struct SimulatedStation {
    metadata: SourceMetadata,
    config: SimulatedConfig,
    timezone: Tz,
    rng: StdRng,
    strikes: u64,
}

impl SimulatedStation {
    pub fn new() -> Self {
        let config = SimulatedConfig::default();
        Self {
            metadata: SourceMetadata {
                id: "simulated".to_string(),
                name: "Simulated Station".to_string(),
                description: "Synthetic weather station with an hourly forecast".to_string(),
                default_interval: Duration::from_secs(3),
                provides_forecast: true,
            },
            timezone: Tz::UTC,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            strikes: 0,
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    /// Position in the local day, 0.0 at midnight
    fn day_fraction(&self, at: DateTime<Utc>) -> f64 {
        let local = at.with_timezone(&self.timezone);
        (local.num_seconds_from_midnight() as f64) / 86_400.0
    }

    /// Temperature curve peaking mid-afternoon
    fn temperature_at(&self, at: DateTime<Utc>) -> f64 {
        let phase = (self.day_fraction(at) - 0.375) * TAU;
        self.config.mean_temperature + self.config.temperature_swing * phase.sin()
    }

    /// Sun strength from 0.0 at night to 1.0 at local noon
    fn daylight_at(&self, at: DateTime<Utc>) -> f64 {
        let phase = (self.day_fraction(at) - 0.25) * TAU;
        phase.sin().max(0.0)
    }

    fn condition(&mut self, humidity: f64) -> &'static str {
        let roll: f64 = self.rng.gen();
        match humidity {
            h if h > 90.0 && roll < 0.2 => "thunderstorm",
            h if h > 85.0 => "rainy",
            h if h > 70.0 => "cloudy",
            h if h > 55.0 || roll < 0.3 => "partly-cloudy",
            _ => "clear",
        }
    }

    fn record(&mut self, at: DateTime<Utc>) -> Map<String, Value> {
        let temperature = self.temperature_at(at) + self.rng.gen_range(-0.3..0.3);
        let humidity = (75.0 - 2.5 * (temperature - self.config.mean_temperature)
            + self.rng.gen_range(-2.0..2.0))
        .clamp(5.0, 100.0);
        let daylight = self.daylight_at(at);
        let wind: f64 = self.rng.gen_range(0.0..6.0);
        let condition = self.condition(humidity);
        let raining = matches!(condition, "rainy" | "thunderstorm");

        let mut raw = Map::new();
        raw.insert("time".to_string(), json!(at.timestamp()));
        raw.insert("air_temperature".to_string(), json!(round(temperature, 1)));
        raw.insert("relative_humidity".to_string(), json!(round(humidity, 0)));
        raw.insert(
            "station_pressure".to_string(),
            json!(round(self.config.mean_pressure + self.rng.gen_range(-1.5..1.5), 1)),
        );
        raw.insert("wind_avg".to_string(), json!(round(wind, 1)));
        raw.insert(
            "wind_gust".to_string(),
            json!(round(wind + self.rng.gen_range(0.0..4.0), 1)),
        );
        raw.insert("wind_direction".to_string(), json!(self.rng.gen_range(0..360)));
        raw.insert("illuminance".to_string(), json!(round(daylight * 100_000.0, 0)));
        raw.insert("solar_radiation".to_string(), json!(round(daylight * 900.0, 0)));
        raw.insert("uv".to_string(), json!(round(daylight * 8.0, 1)));
        raw.insert("conditions".to_string(), json!(condition));
        let rain_mm = if raining {
            self.rng.gen_range(0.0..0.2)
        } else {
            0.0
        };
        raw.insert("precip_rate".to_string(), json!([round(rain_mm, 2), 1]));
        raw
    }

    /// One realtime observation at `at`
    pub fn observe(&mut self, at: DateTime<Utc>) -> Map<String, Value> {
        let mut raw = self.record(at);
        if raw.get("conditions").and_then(Value::as_str) == Some("thunderstorm") {
            self.strikes += self.rng.gen_range(1..5);
            raw.insert(
                "lightning_strike_last_distance".to_string(),
                json!(self.rng.gen_range(1..40)),
            );
        }
        raw.insert("lightning_strike_count".to_string(), json!(self.strikes));
        raw.insert("battery".to_string(), json!(round(2.6 + 0.1 * self.daylight_at(at), 2)));
        raw.insert("serial_number".to_string(), json!("SIM-00001"));
        raw
    }

    /// Hourly forecast starting at the top of the hour containing `now`
    pub fn forecast(&mut self, now: DateTime<Utc>) -> Vec<Map<String, Value>> {
        let start = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
        (0..FORECAST_HOURS)
            .map(|hour| {
                let at = start + TimeDelta::hours(hour);
                let mut raw = self.record(at);
                let humidity = raw
                    .get("relative_humidity")
                    .and_then(Value::as_f64)
                    .unwrap_or(50.0);
                let probability = ((humidity - 60.0) * 2.5).clamp(0.0, 100.0);
                let amount = if probability > 50.0 {
                    self.rng.gen_range(0.0..2.0)
                } else {
                    0.0
                };
                raw.remove("precip_rate");
                raw.insert("precip".to_string(), json!(round(amount, 1)));
                raw.insert("precip_probability".to_string(), json!(round(probability, 0)));
                raw
            })
            .collect()
    }
}

impl Default for SimulatedStation {
    fn default() -> Self {
        Self::new()
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

impl DataSource for SimulatedStation {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn schema(&self) -> Value {
        let alias: Map<String, Value> = CONDITIONS
            .iter()
            .map(|(code, shown)| (code.to_string(), json!(shown)))
            .collect();
        json!({
            "environment": {
                "temperature": {
                    "type": "temperature",
                    "sourceUnit": "c",
                    "temperature": { "sourceKey": ["air_temperature", "temp"] }
                },
                "humidity.humidity": {
                    "type": "humidity", "sourceUnit": "%", "sourceKey": "relative_humidity"
                },
                "pressure": {
                    "type": "pressure",
                    "sourceUnit": "mb",
                    "absolute": { "title": "Station Pressure", "sourceKey": "station_pressure" }
                },
                "wind": {
                    "type": "speed",
                    "sourceUnit": "m/s",
                    "speed": { "sourceKey": "wind_avg" },
                    "gust": { "sourceKey": "wind_gust" },
                    "direction": { "type": "direction", "sourceUnit": "deg", "sourceKey": "wind_direction" }
                },
                "lightning.strike": {
                    "count": { "type": "count", "title": "Strikes", "sourceKey": "lightning_strike_count" },
                    "distance": {
                        "type": "length", "sourceUnit": "km", "sourceKey": "lightning_strike_last_distance"
                    }
                },
                "light": {
                    "illuminance": { "type": "illuminance", "sourceUnit": "lux", "sourceKey": "illuminance" },
                    "irradiance": { "type": "irradiance", "sourceUnit": "W/m2", "sourceKey": "solar_radiation" },
                    "uvi": { "type": "number", "title": "UV Index", "sourceKey": "uv" }
                },
                "precipitation": {
                    "rate": { "type": "precipitationRate", "sourceUnit": "mm/min", "sourceKey": "precip_rate" },
                    "precipitation": {
                        "type": "length", "sourceUnit": "mm", "sourceKey": "precip", "accumulate": true
                    },
                    "probability": { "type": "percentage", "sourceUnit": "%", "sourceKey": "precip_probability" }
                },
                "condition": { "type": "enumeration", "sourceKey": "conditions", "alias": alias }
            },
            "device.battery": { "type": "voltage", "sourceUnit": "V", "sourceKey": "battery" },
            "time.timestamp": {
                "type": "datetime", "sourceUnit": "epoch", "sourceKey": "time", "timezone": "@timezone"
            },
            "ignored": ["serial_number"]
        })
    }

    fn fetch(&mut self) -> Result<Map<String, Value>> {
        Ok(self.observe(Utc::now()))
    }

    fn fetch_forecast(&mut self) -> Result<Vec<Map<String, Value>>> {
        Ok(self.forecast(Utc::now()))
    }

    fn property(&self, name: &str) -> Option<String> {
        match name {
            "timezone" => Some(self.config.timezone.clone()),
            _ => None,
        }
    }

    fn configure(&mut self, settings: &HashMap<String, Value>) -> Result<()> {
        let value = Value::Object(settings.clone().into_iter().collect());
        let config: SimulatedConfig = serde_json::from_value(value)?;
        self.timezone = config
            .timezone
            .parse()
            .map_err(|_| anyhow!("unknown time zone '{}'", config.timezone))?;
        self.rng = StdRng::seed_from_u64(config.seed);
        log::debug!("Simulated station configured: {:?}", config);
        self.config = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use skyboard_core::{CategoryKey, Schema, SourceHandle, SourceSettings, UnitSystem};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SimulatedStation::new();
        let mut b = SimulatedStation::new();
        assert_eq!(a.observe(noon()), b.observe(noon()));
    }

    #[test]
    fn test_schema_parses() {
        let station = SimulatedStation::new();
        let schema = Schema::from_value(&station.schema()).unwrap();
        assert!(schema.computed_properties().contains("timezone"));
        assert!(schema
            .accumulating_keys()
            .contains(&CategoryKey::parse("environment.precipitation.precipitation").unwrap()));
    }

    #[test]
    fn test_configure_rejects_unknown_timezone() {
        let mut station = SimulatedStation::new();
        let mut settings = HashMap::new();
        settings.insert("timezone".to_string(), json!("Mars/Olympus"));
        assert!(station.configure(&settings).is_err());

        settings.insert("timezone".to_string(), json!("Europe/Berlin"));
        assert!(station.configure(&settings).is_ok());
        assert_eq!(station.property("timezone").as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn test_forecast_is_hourly() {
        let mut station = SimulatedStation::new();
        let records = station.forecast(noon() + TimeDelta::minutes(20));
        assert_eq!(records.len(), FORECAST_HOURS as usize);
        assert_eq!(records[0]["time"], json!(noon().timestamp()));
        assert_eq!(records[1]["time"], json!(noon().timestamp() + 3600));
    }

    #[test]
    fn test_every_field_translates() {
        let handle = SourceHandle::load(
            "simulated",
            0,
            Box::new(SimulatedStation::new()),
            &SourceSettings::default(),
            UnitSystem::Metric,
        )
        .unwrap();
        let mut station = SimulatedStation::new();
        let batch = handle.translator().ingest(&station.observe(noon()), Utc::now());
        assert!(batch.failed.is_empty(), "{:?}", batch.failed);
        assert_eq!(batch.timestamp, Some(noon()));

        let temperature = CategoryKey::parse("environment.temperature.temperature").unwrap();
        assert!(batch.values.contains_key(&temperature));
    }
}
