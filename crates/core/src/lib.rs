//! skyboard-core: Schema normalization and multi-source dispatch.
//!
//! Sources declare a schema mapping their raw field names onto hierarchical
//! category keys. This crate resolves those declarations into field
//! descriptors, translates raw records into unit-aware measurements, keeps
//! per-source observations, drives each source's polling worker, and merges
//! every source's values into one logical value per key.

pub mod constants;
pub mod convert;
mod data_source;
pub mod derived;
mod dispatcher;
mod error;
mod handle;
pub mod observation;
mod registry;
pub mod schema;
mod translator;

pub use constants::{
    ACCUMULATION_SEGMENT, DEFAULT_POLL_INTERVAL, DEFAULT_TIMESTAMP_KEY,
    FORECAST_REFRESH_INTERVAL, MIN_POLL_INTERVAL,
};
pub use data_source::{BoxedDataSource, DataSource, SourceMetadata};
pub use dispatcher::{DispatchEvent, Dispatcher, LogicalValue, Resolution, Subscription};
pub use error::{ConversionError, PluginError, SchemaError};
pub use handle::{SourceHandle, SourceState};
pub use observation::{
    ForecastObservation, ForecastSeries, RealtimeObservation, Snapshot,
};
pub use registry::{
    LoadReport, SourceCatalog, SourceEntry, SourceFactory, SourceRegistry,
};
pub use schema::{
    DescriptorCache, FieldDescriptor, NoProperties, PropertyProvider, Schema, SchemaFragment,
    SchemaStore, SchemaView, StaticProperties, ViewEntry,
};
pub use translator::{Batch, FailedField, Translator};

// Re-export types used in public signatures for convenience
pub use skyboard_types::{
    CategoryKey, KeyError, Measurement, SourceSelector, SourceSettings, Unit, UnitSystem, Value,
    ValueType,
};
