//! Configuration management

mod settings;

pub use settings::{EngineConfig, CONFIG_VERSION};
