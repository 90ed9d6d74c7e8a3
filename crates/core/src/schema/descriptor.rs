//! Field descriptor resolution
//!
//! A descriptor is never authored whole. Resolving `a.b.c` layers the
//! fragments found at `a`, `a.b` and `a.b.c` in that order, so deeper
//! declarations override shallower ones field by field, then resolves any
//! computed property against the owning source.

use serde::Serialize;
use skyboard_types::{CategoryKey, SourceSelector, ValueType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::fragment::{Prop, Schema, SchemaFragment};
use crate::error::SchemaError;

/// Answers computed-property references (`@name`) for one source
pub trait PropertyProvider: Send + Sync {
    fn property(&self, name: &str) -> Option<String>;
}

/// Provider with no properties, used when resolving without a source
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProperties;

impl PropertyProvider for NoProperties {
    fn property(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Fixed property table, captured from a source when it is loaded
#[derive(Debug, Clone, Default)]
pub struct StaticProperties(BTreeMap<String, String>);

impl StaticProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PropertyProvider for StaticProperties {
    fn property(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Fully resolved metadata for one concrete key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub key: CategoryKey,
    pub source_keys: Vec<String>,
    pub source_unit: Option<String>,
    pub value_type: ValueType,
    pub title: String,
    pub alias: HashMap<String, String>,
    pub format: Option<String>,
    pub timezone: Option<String>,
    pub accumulate: bool,
}

/// `windChill` -> `Wind Chill`, `dewpoint` -> `Dewpoint`
fn humanize(segment: &str) -> String {
    let mut title = String::with_capacity(segment.len() + 4);
    for (i, ch) in segment.chars().enumerate() {
        if i == 0 {
            title.extend(ch.to_uppercase());
        } else if ch.is_uppercase() {
            title.push(' ');
            title.push(ch);
        } else if ch == '_' {
            title.push(' ');
        } else {
            title.push(ch);
        }
    }
    title
}

fn resolve_prop(
    key: &CategoryKey,
    prop: Option<&Prop<String>>,
    provider: &dyn PropertyProvider,
) -> Result<Option<String>, SchemaError> {
    match prop {
        None => Ok(None),
        Some(Prop::Literal(value)) => Ok(Some(value.clone())),
        Some(Prop::Computed(name)) => provider
            .property(name)
            .map(Some)
            .ok_or_else(|| SchemaError::UnresolvedProperty {
                key: key.clone(),
                property: name.clone(),
            }),
    }
}

impl Schema {
    /// Layer every fragment along `key`'s prefixes, shortest first
    pub fn merged_fragment(&self, key: &CategoryKey) -> Option<SchemaFragment> {
        let key = key.without_source();
        let mut merged: Option<SchemaFragment> = None;
        for prefix in key.prefixes() {
            if let Some(fragment) = self.fragment(&prefix) {
                merged
                    .get_or_insert_with(SchemaFragment::default)
                    .overlay(fragment);
            }
        }
        merged
    }

    /// Resolve `key` without consulting the cache
    pub fn resolve_uncached(
        &self,
        key: &CategoryKey,
        provider: &dyn PropertyProvider,
    ) -> Result<FieldDescriptor, SchemaError> {
        let merged = self
            .merged_fragment(key)
            .ok_or_else(|| SchemaError::ValueNotFound {
                key: key.clone(),
                missing: "schema",
            })?;

        let value_type = resolve_prop(key, merged.value_type.as_ref(), provider)?.ok_or_else(
            || SchemaError::ValueNotFound {
                key: key.clone(),
                missing: "type",
            },
        )?;
        let value_type: ValueType =
            value_type
                .parse()
                .map_err(|e: skyboard_types::UnitError| SchemaError::InvalidDeclaration {
                    path: key.to_string(),
                    reason: e.to_string(),
                })?;

        let source_unit = resolve_prop(key, merged.source_unit.as_ref(), provider)?;
        if source_unit.is_none() && value_type.requires_source_unit() {
            return Err(SchemaError::ValueNotFound {
                key: key.clone(),
                missing: "sourceUnit",
            });
        }

        let title = match resolve_prop(key, merged.title.as_ref(), provider)? {
            Some(title) => title,
            None => key.name().map(humanize).unwrap_or_default(),
        };

        Ok(FieldDescriptor {
            key: key.without_source(),
            source_keys: merged.source_key.unwrap_or_default(),
            source_unit,
            value_type,
            title,
            alias: merged.alias.unwrap_or_default(),
            format: resolve_prop(key, merged.format.as_ref(), provider)?,
            timezone: resolve_prop(key, merged.timezone.as_ref(), provider)?,
            accumulate: merged.accumulate.unwrap_or(false),
        })
    }
}

/// Append-only cache of resolved descriptors, keyed on `(key, source)`.
///
/// Keys are interned, so the lookup hashes a pointer. Schemas are static once
/// a source is loaded and entries are never invalidated.
#[derive(Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<(CategoryKey, SourceSelector), Arc<FieldDescriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached descriptor for `key` as seen by `source`, resolving it on first use
    pub fn resolve(
        &self,
        schema: &Schema,
        key: &CategoryKey,
        source: &SourceSelector,
        provider: &dyn PropertyProvider,
    ) -> Result<Arc<FieldDescriptor>, SchemaError> {
        let cache_key = (key.without_source(), source.clone());
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(descriptor) = entries.get(&cache_key) {
                return Ok(Arc::clone(descriptor));
            }
        }

        let descriptor = Arc::new(schema.resolve_uncached(key, provider)?);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(entries.entry(cache_key).or_insert(descriptor)))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
