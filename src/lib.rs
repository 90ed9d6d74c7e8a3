//! skyboard: A live environmental measurements dashboard engine
//!
//! This library wires the engine together for the binary:
//! - Configuration loading and saving
//! - Source discovery, loading and startup
//! - Printing resolved values as they change

pub mod config;
pub mod engine;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::Engine;
