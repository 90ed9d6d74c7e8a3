//! Authored schema fragments and the declaration parser
//!
//! A source declares its schema as a nested mapping from dotted key prefixes
//! to fragment records:
//!
//! ```json
//! {
//!   "environment.temperature": {
//!     "type": "temperature",
//!     "sourceUnit": "c",
//!     "temperature": { "sourceKey": ["air_temperature", "temp"] },
//!     "dewpoint": { "sourceKey": "dew_point", "title": "Dew Point" }
//!   },
//!   "time.timestamp": { "type": "datetime", "sourceUnit": "epoch", "sourceKey": "timestamp" },
//!   "ignored": ["firmware_revision"]
//! }
//! ```
//!
//! Recognised record fields set the fragment at the current prefix; any other
//! nested mapping is a child prefix. String values starting with `@` are
//! computed properties, resolved against the owning source.

use serde_json::Value;
use skyboard_types::CategoryKey;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::constants::DEFAULT_TIMESTAMP_KEY;
use crate::error::SchemaError;

/// Fragment value: literal, or the name of a property of the owning source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prop<T> {
    Literal(T),
    Computed(String),
}

impl Prop<String> {
    /// `"@name"` becomes `Computed("name")`, anything else a literal
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix('@') {
            Some(name) if !name.is_empty() => Prop::Computed(name.to_string()),
            _ => Prop::Literal(text.to_string()),
        }
    }
}

impl From<&str> for Prop<String> {
    fn from(text: &str) -> Self {
        Prop::parse(text)
    }
}

/// Metadata authored at one key prefix. Every field is optional; resolution
/// layers fragments from the shortest prefix to the longest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaFragment {
    pub value_type: Option<Prop<String>>,
    pub source_unit: Option<Prop<String>>,
    /// Raw field-name aliases, in preference order
    pub source_key: Option<Vec<String>>,
    pub title: Option<Prop<String>>,
    pub alias: Option<HashMap<String, String>>,
    pub format: Option<Prop<String>>,
    pub timezone: Option<Prop<String>>,
    pub accumulate: Option<bool>,
}

impl SchemaFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_type(mut self, value_type: &str) -> Self {
        self.value_type = Some(Prop::parse(value_type));
        self
    }

    pub fn source_unit(mut self, unit: &str) -> Self {
        self.source_unit = Some(Prop::parse(unit));
        self
    }

    pub fn source_key(mut self, key: &str) -> Self {
        self.source_key = Some(vec![key.to_string()]);
        self
    }

    pub fn source_keys(mut self, keys: &[&str]) -> Self {
        self.source_key = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(Prop::parse(title));
        self
    }

    pub fn alias(mut self, table: &[(&str, &str)]) -> Self {
        self.alias = Some(
            table
                .iter()
                .map(|(raw, shown)| (raw.to_string(), shown.to_string()))
                .collect(),
        );
        self
    }

    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(Prop::parse(format));
        self
    }

    pub fn timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(Prop::parse(timezone));
        self
    }

    pub fn accumulate(mut self, accumulate: bool) -> Self {
        self.accumulate = Some(accumulate);
        self
    }

    /// Lay `other` over `self`, field by field
    pub fn overlay(&mut self, other: &SchemaFragment) {
        if other.value_type.is_some() {
            self.value_type = other.value_type.clone();
        }
        if other.source_unit.is_some() {
            self.source_unit = other.source_unit.clone();
        }
        if other.source_key.is_some() {
            self.source_key = other.source_key.clone();
        }
        if other.title.is_some() {
            self.title = other.title.clone();
        }
        if let Some(alias) = &other.alias {
            self.alias
                .get_or_insert_with(HashMap::new)
                .extend(alias.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if other.format.is_some() {
            self.format = other.format.clone();
        }
        if other.timezone.is_some() {
            self.timezone = other.timezone.clone();
        }
        if other.accumulate.is_some() {
            self.accumulate = other.accumulate;
        }
    }

    /// Names of computed properties referenced by this fragment
    pub fn computed_properties(&self) -> impl Iterator<Item = &str> {
        [
            &self.value_type,
            &self.source_unit,
            &self.title,
            &self.format,
            &self.timezone,
        ]
        .into_iter()
        .filter_map(|prop| match prop {
            Some(Prop::Computed(name)) => Some(name.as_str()),
            _ => None,
        })
    }
}

const FIELD_TYPE: &str = "type";
const FIELD_SOURCE_UNIT: &str = "sourceUnit";
const FIELD_SOURCE_KEY: &str = "sourceKey";
const FIELD_TITLE: &str = "title";
const FIELD_ALIAS: &str = "alias";
const FIELD_FORMAT: &str = "format";
const FIELD_TIMEZONE: &str = "timezone";
const FIELD_ACCUMULATE: &str = "accumulate";

const TOP_IGNORED: &str = "ignored";
const TOP_RENAMES: &str = "renames";
const TOP_TIMESTAMP_KEY: &str = "timestampKey";

/// One source's authored schema
#[derive(Debug, Clone)]
pub struct Schema {
    fragments: HashMap<CategoryKey, SchemaFragment>,
    ignored: HashSet<String>,
    renames: HashMap<String, String>,
    timestamp_key: CategoryKey,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            fragments: HashMap::new(),
            ignored: HashSet::new(),
            renames: HashMap::new(),
            timestamp_key: default_timestamp_key(),
        }
    }
}

fn default_timestamp_key() -> CategoryKey {
    CategoryKey::parse(DEFAULT_TIMESTAMP_KEY).unwrap_or_else(|_| CategoryKey::root())
}

fn invalid(path: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidDeclaration {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn string_prop(path: &CategoryKey, field: &str, value: &Value) -> Result<Prop<String>, SchemaError> {
    match value {
        Value::String(s) => Ok(Prop::parse(s)),
        Value::Number(n) => Ok(Prop::Literal(n.to_string())),
        other => Err(invalid(
            &format!("{}.{}", path, field),
            format!("expected a string, got {}", other),
        )),
    }
}

fn string_list(path: &str, value: &Value) -> Result<Vec<String>, SchemaError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(invalid(path, format!("expected a string, got {}", other))),
            })
            .collect(),
        other => Err(invalid(
            path,
            format!("expected a string or a list, got {}", other),
        )),
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a declaration (see the module docs for the format)
    pub fn from_value(declaration: &Value) -> Result<Self, SchemaError> {
        let Value::Object(top) = declaration else {
            return Err(invalid("", "declaration must be a mapping"));
        };

        let mut schema = Schema::new();
        for (name, value) in top {
            match name.as_str() {
                TOP_IGNORED => {
                    schema.ignored.extend(string_list(TOP_IGNORED, value)?);
                }
                TOP_RENAMES => {
                    let Value::Object(table) = value else {
                        return Err(invalid(TOP_RENAMES, "expected a mapping"));
                    };
                    for (raw, renamed) in table {
                        let renamed = renamed
                            .as_str()
                            .ok_or_else(|| invalid(TOP_RENAMES, "rename targets must be strings"))?;
                        schema.renames.insert(raw.clone(), renamed.to_string());
                    }
                }
                TOP_TIMESTAMP_KEY => {
                    let text = value
                        .as_str()
                        .ok_or_else(|| invalid(TOP_TIMESTAMP_KEY, "expected a dotted key"))?;
                    schema.timestamp_key = CategoryKey::parse(text)?;
                }
                _ => {
                    let prefix = CategoryKey::parse(name)?;
                    schema.parse_node(&prefix, value)?;
                }
            }
        }
        Ok(schema)
    }

    fn parse_node(&mut self, prefix: &CategoryKey, node: &Value) -> Result<(), SchemaError> {
        let Value::Object(entries) = node else {
            return Err(invalid(&prefix.to_string(), "expected a mapping"));
        };

        let mut fragment = SchemaFragment::default();
        let mut touched = false;
        for (name, value) in entries {
            if value.is_null() {
                continue;
            }
            let path = format!("{}.{}", prefix, name);
            match name.as_str() {
                FIELD_TYPE => fragment.value_type = Some(string_prop(prefix, name, value)?),
                FIELD_SOURCE_UNIT => fragment.source_unit = Some(string_prop(prefix, name, value)?),
                FIELD_TITLE => fragment.title = Some(string_prop(prefix, name, value)?),
                FIELD_FORMAT => fragment.format = Some(string_prop(prefix, name, value)?),
                FIELD_TIMEZONE => fragment.timezone = Some(string_prop(prefix, name, value)?),
                FIELD_SOURCE_KEY => fragment.source_key = Some(string_list(&path, value)?),
                FIELD_ACCUMULATE => {
                    fragment.accumulate =
                        Some(value.as_bool().ok_or_else(|| invalid(&path, "expected a boolean"))?);
                }
                FIELD_ALIAS => {
                    let Value::Object(table) = value else {
                        return Err(invalid(&path, "expected a mapping"));
                    };
                    let alias = table
                        .iter()
                        .map(|(raw, shown)| {
                            let shown = match shown {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (raw.clone(), shown)
                        })
                        .collect();
                    fragment.alias = Some(alias);
                }
                _ => {
                    let child = prefix.child(name)?;
                    self.parse_node(&child, value)?;
                    continue;
                }
            }
            touched = true;
        }

        if touched {
            self.insert(prefix.clone(), fragment);
        }
        Ok(())
    }

    /// Add a fragment at `prefix`, layering over any fragment already there
    pub fn insert(&mut self, prefix: CategoryKey, fragment: SchemaFragment) {
        self.fragments
            .entry(prefix)
            .and_modify(|existing| existing.overlay(&fragment))
            .or_insert(fragment);
    }

    /// Builder form of [`Schema::insert`]
    pub fn with(mut self, prefix: &str, fragment: SchemaFragment) -> Result<Self, SchemaError> {
        self.insert(CategoryKey::parse(prefix)?, fragment);
        Ok(self)
    }

    pub fn ignore(mut self, raw_field: &str) -> Self {
        self.ignored.insert(raw_field.to_string());
        self
    }

    pub fn rename(mut self, raw_field: &str, to: &str) -> Self {
        self.renames.insert(raw_field.to_string(), to.to_string());
        self
    }

    pub fn fragment(&self, prefix: &CategoryKey) -> Option<&SchemaFragment> {
        self.fragments.get(prefix)
    }

    pub fn fragments(&self) -> impl Iterator<Item = (&CategoryKey, &SchemaFragment)> {
        self.fragments.iter()
    }

    pub fn ignored(&self) -> &HashSet<String> {
        &self.ignored
    }

    pub fn renames(&self) -> &HashMap<String, String> {
        &self.renames
    }

    pub fn timestamp_key(&self) -> &CategoryKey {
        &self.timestamp_key
    }

    /// Keys that map raw fields, i.e. whose own fragment declares `sourceKey`
    pub fn leaf_keys(&self) -> BTreeSet<CategoryKey> {
        self.fragments
            .iter()
            .filter(|(_, fragment)| fragment.source_key.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys whose own fragment asks for a running accumulation
    pub fn accumulating_keys(&self) -> BTreeSet<CategoryKey> {
        self.fragments
            .iter()
            .filter(|(_, fragment)| fragment.accumulate == Some(true))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every computed property name referenced anywhere in the schema
    pub fn computed_properties(&self) -> BTreeSet<String> {
        self.fragments
            .values()
            .flat_map(|fragment| fragment.computed_properties().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_nested_declaration() {
        let schema = Schema::from_value(&json!({
            "environment.temperature": {
                "type": "temperature",
                "sourceUnit": "c",
                "temperature": { "sourceKey": ["air_temperature", "temp"] },
                "dewpoint": { "sourceKey": "dew_point", "title": "Dew Point" }
            },
            "ignored": ["firmware_revision"],
            "renames": { "airTemp": "air_temperature" }
        }))
        .unwrap();

        let base = schema
            .fragment(&CategoryKey::parse("environment.temperature").unwrap())
            .unwrap();
        assert_eq!(base.source_unit, Some(Prop::Literal("c".to_string())));

        let leaf = schema
            .fragment(&CategoryKey::parse("environment.temperature.temperature").unwrap())
            .unwrap();
        assert_eq!(
            leaf.source_key,
            Some(vec!["air_temperature".to_string(), "temp".to_string()])
        );
        assert_eq!(schema.leaf_keys().len(), 2);
        assert!(schema.ignored().contains("firmware_revision"));
        assert_eq!(schema.renames()["airTemp"], "air_temperature");
    }

    #[test]
    fn test_computed_property_marker() {
        assert_eq!(Prop::parse("@timezone"), Prop::Computed("timezone".to_string()));
        assert_eq!(Prop::parse("@"), Prop::Literal("@".to_string()));

        let schema = Schema::from_value(&json!({
            "time.observed": { "type": "datetime", "sourceUnit": "%H:%M", "timezone": "@timezone" }
        }))
        .unwrap();
        assert!(schema.computed_properties().contains("timezone"));
    }

    #[test]
    fn test_invalid_declarations() {
        assert!(matches!(
            Schema::from_value(&json!(["not", "a", "mapping"])),
            Err(SchemaError::InvalidDeclaration { .. })
        ));
        assert!(matches!(
            Schema::from_value(&json!({ "a.b": { "accumulate": "yes" } })),
            Err(SchemaError::InvalidDeclaration { .. })
        ));
        assert!(matches!(
            Schema::from_value(&json!({ "a..b": { "type": "count" } })),
            Err(SchemaError::Key(_))
        ));
    }

    #[test]
    fn test_overlay_is_field_by_field() {
        let mut base = SchemaFragment::new()
            .value_type("pressure")
            .source_unit("mb")
            .alias(&[("1", "rising")]);
        base.overlay(&SchemaFragment::new().title("Absolute").alias(&[("2", "falling")]));
        assert_eq!(base.source_unit, Some(Prop::Literal("mb".to_string())));
        assert_eq!(base.title, Some(Prop::Literal("Absolute".to_string())));
        assert_eq!(base.alias.as_ref().map(|a| a.len()), Some(2));
    }
}
