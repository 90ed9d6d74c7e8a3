//! Error types raised by the engine
//!
//! Source implementations report failures through `anyhow`; the engine wraps
//! them in the typed errors below at its boundary so callers can tell a
//! skipped source from a dropped field from an ambiguous lookup.

use skyboard_types::{CategoryKey, KeyError, UnitError};
use thiserror::Error;

/// Schema lookup and descriptor resolution failures
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    /// No fragment along the key's prefixes declares what is needed to interpret it
    #[error("no schema for '{key}': missing {missing}")]
    ValueNotFound {
        key: CategoryKey,
        missing: &'static str,
    },
    /// A wildcard lookup matched several branches where one was required
    #[error("'{key}' is ambiguous: matches {}", .matches.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", "))]
    AmbiguousKey {
        key: CategoryKey,
        matches: Vec<CategoryKey>,
    },
    #[error("key '{0}' not found")]
    KeyNotFound(CategoryKey),
    /// A computed property (`@name`) the owning source does not provide
    #[error("'{key}' refers to property '@{property}' which the source does not provide")]
    UnresolvedProperty { key: CategoryKey, property: String },
    /// A declaration could not be parsed
    #[error("invalid schema declaration at '{path}': {reason}")]
    InvalidDeclaration { path: String, reason: String },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Failure converting one raw field
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    #[error("expected {expected}, got {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: String,
    },
    #[error(transparent)]
    Unit(#[from] UnitError),
    #[error("cannot parse timestamp '{value}' as {convention}")]
    BadTimestamp { value: String, convention: String },
    #[error("cannot parse duration '{0}'")]
    BadDuration(String),
    #[error("composite value is missing its {0}")]
    MissingComponent(&'static str),
    #[error("unknown time zone '{0}'")]
    UnknownTimezone(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Reasons a source could not be loaded; the registry skips the source
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("source '{0}' does not declare an entry point")]
    MissingDeclaration(String),
    #[error("source '{0}' is disabled")]
    SourceDisabled(String),
    #[error("source '{name}' failed to load: {source:#}")]
    Load {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PluginError {
    pub fn load(name: &str, source: impl Into<anyhow::Error>) -> Self {
        PluginError::Load {
            name: name.to_string(),
            source: source.into(),
        }
    }
}
