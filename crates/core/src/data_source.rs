//! Data source trait and related types

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Metadata about a data source
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    /// Unique identifier for this source type
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Description of what this source provides
    pub description: String,
    /// Recommended update interval
    pub default_interval: Duration,
    /// Whether [`DataSource::fetch_forecast`] returns anything
    pub provides_forecast: bool,
}

/// Trait for all data sources
///
/// A source knows how to talk to one device or service and returns raw
/// records under its own field names. Naming, units and merging with other
/// sources are handled by the engine through the schema the source declares.
pub trait DataSource: Send + Sync {
    /// Get metadata about this source
    fn metadata(&self) -> &SourceMetadata;

    /// Schema declaration, see [`crate::schema::Schema::from_value`]
    fn schema(&self) -> Value;

    /// Fetch one realtime record. May block on I/O.
    fn fetch(&mut self) -> Result<Map<String, Value>>;

    /// Fetch forecast records, oldest first
    fn fetch_forecast(&mut self) -> Result<Vec<Map<String, Value>>> {
        Ok(Vec::new())
    }

    /// Value of a computed property referenced as `@name` in the schema
    fn property(&self, _name: &str) -> Option<String> {
        None
    }

    /// Check if this source can be used on the current system
    fn is_available(&self) -> bool {
        true
    }

    /// Configure the data source with source-specific settings
    fn configure(&mut self, _settings: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }
}

/// Type-erased data source for dynamic dispatch
pub type BoxedDataSource = Box<dyn DataSource>;
