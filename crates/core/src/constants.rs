//! Shared constants for the engine

use std::time::Duration;

/// Key whose converted value stamps each record unless a schema names another
pub const DEFAULT_TIMESTAMP_KEY: &str = "time.timestamp";

/// Poll interval used when neither the source nor its settings give one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Lower bound on any poll interval, to keep a misconfigured source from spinning
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How often a forecast-capable source refreshes its forecast series
pub const FORECAST_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Last segment of the running-total companion of an `accumulate` field
pub const ACCUMULATION_SEGMENT: &str = "accumulation";

/// Capacity of the new-key broadcast channel
pub const NEW_KEY_CHANNEL_CAPACITY: usize = 256;
