//! Per-source translation from raw fields to category keys
//!
//! A `Translator` is built once when its source is loaded and owned by that
//! source's handle. It maps raw field names onto keys through the schema's
//! `sourceKey` aliases, then converts each value with the key's resolved
//! descriptor. One bad field never sinks the batch: it is logged and listed
//! in [`Batch::failed`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use skyboard_types::{CategoryKey, Measurement, SourceSelector, UnitSystem};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::convert;
use crate::error::{ConversionError, SchemaError};
use crate::schema::{DescriptorCache, FieldDescriptor, PropertyProvider, Schema};

/// A raw field that could not be converted
#[derive(Debug, Clone)]
pub struct FailedField {
    pub field: String,
    pub key: CategoryKey,
    pub error: ConversionError,
}

/// Result of translating one raw record
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Record time, from the schema's timestamp key when present
    pub timestamp: Option<DateTime<Utc>>,
    pub values: HashMap<CategoryKey, Measurement>,
    pub failed: Vec<FailedField>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Raw-field to key mapping and value conversion for one source
pub struct Translator {
    source: Arc<str>,
    selector: SourceSelector,
    schema: Schema,
    /// Leaf key -> accepted raw names, in preference order
    leaves: BTreeMap<CategoryKey, Vec<String>>,
    /// Raw name -> keys it can feed
    index: HashMap<String, Vec<CategoryKey>>,
    properties: Arc<dyn PropertyProvider>,
    cache: DescriptorCache,
    units: UnitSystem,
}

impl Translator {
    pub fn new(
        source: &str,
        schema: Schema,
        properties: Arc<dyn PropertyProvider>,
        units: UnitSystem,
    ) -> Self {
        let mut leaves = BTreeMap::new();
        let mut index: HashMap<String, Vec<CategoryKey>> = HashMap::new();
        for key in schema.leaf_keys() {
            let aliases = schema
                .merged_fragment(&key)
                .and_then(|fragment| fragment.source_key)
                .unwrap_or_default();
            for alias in &aliases {
                index.entry(alias.clone()).or_default().push(key.clone());
            }
            leaves.insert(key, aliases);
        }
        log::debug!(
            "Translator for '{}': {} keys from {} raw names",
            source,
            leaves.len(),
            index.len()
        );

        Self {
            source: Arc::from(source),
            selector: SourceSelector::named(source),
            schema,
            leaves,
            index,
            properties,
            cache: DescriptorCache::new(),
            units,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn units(&self) -> UnitSystem {
        self.units
    }

    /// Keys this source can produce
    pub fn keys(&self) -> impl Iterator<Item = &CategoryKey> {
        self.leaves.keys()
    }

    /// Keys a raw field name (after renames) can feed
    pub fn keys_for(&self, raw_field: &str) -> &[CategoryKey] {
        let name = self.renamed(raw_field);
        self.index.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn renamed<'a>(&'a self, raw_field: &'a str) -> &'a str {
        self.schema
            .renames()
            .get(raw_field)
            .map(String::as_str)
            .unwrap_or(raw_field)
    }

    /// First declared alias of `key` actually present in `raw`
    pub fn find_key<'a>(&self, key: &CategoryKey, raw: &'a Map<String, Value>) -> Option<&'a str> {
        let aliases = self.leaves.get(&key.without_source())?;
        aliases.iter().find_map(|alias| {
            raw.get_key_value(alias.as_str()).map(|(name, _)| name.as_str())
        })
    }

    /// Key -> raw field name for every key whose aliases appear in `raw`.
    ///
    /// `raw` must already have renames applied.
    pub fn key_map<'a>(&self, raw: &'a Map<String, Value>) -> BTreeMap<CategoryKey, &'a str> {
        self.leaves
            .keys()
            .filter_map(|key| self.find_key(key, raw).map(|field| (key.clone(), field)))
            .collect()
    }

    /// Resolved descriptor for `key` as seen by this source
    pub fn descriptor(&self, key: &CategoryKey) -> Result<Arc<FieldDescriptor>, SchemaError> {
        self.cache
            .resolve(&self.schema, key, &self.selector, self.properties.as_ref())
    }

    /// Descriptors of every key this source declares; unresolvable keys are logged and skipped
    pub fn descriptors(&self) -> Vec<Arc<FieldDescriptor>> {
        self.leaves
            .keys()
            .filter_map(|key| match self.descriptor(key) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    log::warn!("Source '{}' declares {} but {}", self.source, key, e);
                    None
                }
            })
            .collect()
    }

    fn convert_field(
        &self,
        key: &CategoryKey,
        raw: &Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Measurement, ConversionError> {
        let descriptor = self.descriptor(key)?;
        convert::convert(&descriptor, raw, timestamp, self.units)
    }

    /// Translate one raw record.
    ///
    /// Ignored fields are dropped before key lookup, even when they alias a
    /// declared key. Unknown fields are logged at debug level, failed
    /// conversions are logged at error level and reported in the
    /// batch. Every converted value carries the record's timestamp, or
    /// `received` when the record has none.
    pub fn ingest(&self, raw: &Map<String, Value>, received: DateTime<Utc>) -> Batch {
        let renamed: Map<String, Value>;
        let raw = if self.schema.renames().is_empty() {
            raw
        } else {
            renamed = raw
                .iter()
                .map(|(name, value)| (self.renamed(name).to_string(), value.clone()))
                .collect();
            &renamed
        };

        let ignored = self.schema.ignored();
        let kept: Map<String, Value>;
        let raw = if raw.keys().any(|name| ignored.contains(name)) {
            kept = raw
                .iter()
                .filter(|(name, _)| {
                    let skip = ignored.contains(*name);
                    if skip {
                        log::trace!("Source '{}': ignoring field '{}'", self.source, name);
                    }
                    !skip
                })
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            &kept
        } else {
            raw
        };

        let key_map = self.key_map(raw);
        let mut batch = Batch::default();

        let timestamp_key = self.schema.timestamp_key();
        if let Some(field) = key_map.get(timestamp_key) {
            match self.convert_field(timestamp_key, &raw[*field], received) {
                Ok(measurement) => batch.timestamp = measurement.value.as_time(),
                Err(e) => log::error!(
                    "Source '{}': bad record timestamp '{}': {}",
                    self.source,
                    field,
                    e
                ),
            }
        }
        let stamp = batch.timestamp.unwrap_or(received);

        for (key, field) in &key_map {
            match self.convert_field(key, &raw[*field], stamp) {
                Ok(measurement) => {
                    batch.values.insert(key.clone(), measurement);
                }
                Err(error) => {
                    log::error!(
                        "Source '{}': cannot convert '{}' for {}: {}",
                        self.source,
                        field,
                        key,
                        error
                    );
                    batch.failed.push(FailedField {
                        field: field.to_string(),
                        key: key.clone(),
                        error,
                    });
                }
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            let used: std::collections::HashSet<&str> = key_map.values().copied().collect();
            for name in raw.keys() {
                if !used.contains(name.as_str()) {
                    log::debug!("Source '{}': no key for field '{}'", self.source, name);
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NoProperties, StaticProperties};
    use serde_json::json;
    use skyboard_types::Unit;

    fn key(s: &str) -> CategoryKey {
        CategoryKey::parse(s).unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn station_schema() -> Schema {
        Schema::from_value(&json!({
            "environment.temperature": {
                "type": "temperature",
                "sourceUnit": "c",
                "temperature": { "sourceKey": ["air_temperature", "temp"] }
            },
            "environment.humidity.humidity": { "type": "humidity", "sourceUnit": "%", "sourceKey": "rh" },
            "environment.pressure.absolute": { "type": "pressure", "sourceUnit": "mb", "sourceKey": "station_pressure" },
            "time.timestamp": { "type": "datetime", "sourceUnit": "epoch", "sourceKey": "timestamp" },
            "ignored": ["firmware_revision"],
            "renames": { "airTemp": "air_temperature" }
        }))
        .unwrap()
    }

    fn translator() -> Translator {
        Translator::new("station", station_schema(), Arc::new(NoProperties), UnitSystem::Metric)
    }

    #[test]
    fn test_alias_order_and_presence() {
        let t = translator();
        let temperature = key("environment.temperature.temperature");

        let old_firmware = object(json!({ "temp": 20.0 }));
        assert_eq!(t.find_key(&temperature, &old_firmware), Some("temp"));

        let both = object(json!({ "temp": 20.0, "air_temperature": 21.0 }));
        assert_eq!(t.find_key(&temperature, &both), Some("air_temperature"));

        assert_eq!(t.keys_for("temp"), &[temperature]);
        assert!(t.keys_for("wind").is_empty());
    }

    #[test]
    fn test_ingest_converts_and_stamps() {
        let t = translator();
        let raw = object(json!({
            "air_temperature": 21.5,
            "rh": 40,
            "station_pressure": 1012.0,
            "timestamp": 1_700_000_000,
            "firmware_revision": 171,
            "mystery": true
        }));
        let batch = t.ingest(&raw, Utc::now());
        assert!(batch.failed.is_empty());
        assert_eq!(batch.len(), 4);

        let stamp = batch.timestamp.unwrap();
        assert_eq!(stamp.timestamp(), 1_700_000_000);
        let pressure = &batch.values[&key("environment.pressure.absolute")];
        assert_eq!(pressure.unit, Unit::Hectopascal);
        assert_eq!(pressure.timestamp, stamp);
    }

    #[test]
    fn test_ignored_alias_is_not_published() {
        let schema = Schema::from_value(&json!({
            "environment.temperature.temperature": {
                "type": "temperature",
                "sourceUnit": "c",
                "sourceKey": ["air_temperature", "temp"]
            },
            "ignored": ["temp"]
        }))
        .unwrap();
        let t = Translator::new("station", schema, Arc::new(NoProperties), UnitSystem::Metric);

        let batch = t.ingest(&object(json!({ "temp": -40.0 })), Utc::now());
        assert!(batch.values.is_empty());
        assert!(batch.failed.is_empty());

        let batch = t.ingest(&object(json!({ "temp": -40.0, "air_temperature": 12.0 })), Utc::now());
        let m = &batch.values[&key("environment.temperature.temperature")];
        assert_eq!(m.as_f64(), Some(12.0));
    }

    #[test]
    fn test_renames_apply_before_lookup() {
        let t = translator();
        let raw = object(json!({ "airTemp": 18.0 }));
        let batch = t.ingest(&raw, Utc::now());
        let m = &batch.values[&key("environment.temperature.temperature")];
        assert_eq!(m.as_f64(), Some(18.0));
    }

    #[test]
    fn test_failed_field_is_reported_not_fatal() {
        let t = translator();
        let raw = object(json!({ "air_temperature": "warm", "rh": 55 }));
        let batch = t.ingest(&raw, Utc::now());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].field, "air_temperature");
    }

    #[test]
    fn test_descriptor_uses_source_properties() {
        let schema = Schema::from_value(&json!({
            "time.sunrise": { "type": "datetime", "sourceUnit": "%H:%M", "timezone": "@timezone", "sourceKey": "sunrise" }
        }))
        .unwrap();
        let props = StaticProperties::new().with("timezone", "America/New_York");
        let t = Translator::new("almanac", schema, Arc::new(props), UnitSystem::Metric);
        let descriptor = t.descriptor(&key("time.sunrise")).unwrap();
        assert_eq!(descriptor.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(t.descriptors().len(), 1);
    }
}
