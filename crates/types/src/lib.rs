//! skyboard-types: Shared data types for the skyboard measurement engine.
//!
//! This crate contains pure data types (category keys, units, measurements,
//! source settings) shared by every skyboard crate. Nothing here performs I/O
//! or depends on an async runtime.

pub mod key;
pub mod measurement;
pub mod source;
pub mod units;

// Re-export commonly used types at the crate root for convenience
pub use key::{interned_count, CategoryKey, KeyError, SEPARATOR, WILDCARD};
pub use measurement::{Measurement, Value};
pub use source::{SourceSelector, SourceSettings, ANY_SOURCE};
pub use units::{Dimension, Unit, UnitError, UnitSystem, ValueType};
