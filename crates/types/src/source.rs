//! Source identities and per-source settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Token meaning "resolve with no source preference"
pub const ANY_SOURCE: &str = "any";

/// Which source a read should be answered from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SourceSelector {
    /// No preference; the dispatcher picks deterministically
    #[default]
    Any,
    /// A specific source, by registry name
    Named(Arc<str>),
}

impl SourceSelector {
    pub fn named(name: &str) -> Self {
        Self::from(name)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SourceSelector::Any => None,
            SourceSelector::Named(name) => Some(name),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, SourceSelector::Any)
    }
}

impl From<&str> for SourceSelector {
    fn from(name: &str) -> Self {
        if name.is_empty() || name.eq_ignore_ascii_case(ANY_SOURCE) || name == "*" {
            SourceSelector::Any
        } else {
            SourceSelector::Named(Arc::from(name))
        }
    }
}

impl fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSelector::Any => f.write_str(ANY_SOURCE),
            SourceSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Persisted configuration for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Category prefixes this source is the default provider for
    #[serde(default, rename = "defaultFor")]
    pub default_for: Vec<String>,
    /// Poll interval override in milliseconds
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Source-specific settings passed to `DataSource::configure`
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_for: Vec::new(),
            interval_ms: None,
            settings: HashMap::new(),
        }
    }
}
