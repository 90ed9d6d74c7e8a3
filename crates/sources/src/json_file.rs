//! JSON file bridge
//!
//! Reads one JSON object per poll from a file another program keeps up to
//! date, e.g. a logger attached to a station console. The schema is part of
//! the source's settings since the file's field names are not known ahead of
//! time.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use skyboard_core::{DataSource, SourceMetadata, DEFAULT_POLL_INTERVAL};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for the file bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFileConfig {
    /// File holding the latest realtime record
    pub path: Option<PathBuf>,
    /// Optional file holding a list of forecast records
    #[serde(default)]
    pub forecast_path: Option<PathBuf>,
    /// Schema declaration for the file's fields
    #[serde(default = "empty_schema")]
    pub schema: Value,
}

fn empty_schema() -> Value {
    Value::Object(Map::new())
}

impl Default for JsonFileConfig {
    fn default() -> Self {
        Self {
            path: None,
            forecast_path: None,
            schema: empty_schema(),
        }
    }
}

/// Device bridge reading records from JSON files
pub struct JsonFileSource {
    metadata: SourceMetadata,
    config: JsonFileConfig,
}

impl JsonFileSource {
    pub fn new() -> Self {
        Self {
            metadata: SourceMetadata {
                id: "json_file".to_string(),
                name: "JSON File".to_string(),
                description: "Device bridge reading observations from a JSON file".to_string(),
                default_interval: DEFAULT_POLL_INTERVAL,
                provides_forecast: false,
            },
            config: JsonFileConfig::default(),
        }
    }

    pub fn config(&self) -> &JsonFileConfig {
        &self.config
    }
}

impl Default for JsonFileSource {
    fn default() -> Self {
        Self::new()
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

impl DataSource for JsonFileSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn schema(&self) -> Value {
        self.config.schema.clone()
    }

    fn fetch(&mut self) -> Result<Map<String, Value>> {
        let path = self
            .config
            .path
            .as_deref()
            .ok_or_else(|| anyhow!("no path configured"))?;
        match read_json(path)? {
            Value::Object(record) => Ok(record),
            other => bail!("{} holds {} instead of an object", path.display(), other),
        }
    }

    fn fetch_forecast(&mut self) -> Result<Vec<Map<String, Value>>> {
        let Some(path) = self.config.forecast_path.as_deref() else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = read_json(path)? else {
            bail!("{} does not hold a list", path.display());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                other => {
                    log::debug!("Skipping forecast entry {}", other);
                    None
                }
            })
            .collect())
    }

    fn configure(&mut self, settings: &HashMap<String, Value>) -> Result<()> {
        let value = Value::Object(settings.clone().into_iter().collect());
        let config: JsonFileConfig = serde_json::from_value(value)?;
        if config.path.is_none() {
            log::debug!("JSON file source has no path yet");
        }
        if !config.schema.is_object() {
            bail!("the 'schema' setting must be a mapping");
        }
        self.metadata.provides_forecast = config.forecast_path.is_some();
        self.config = config;
        Ok(())
    }
}
