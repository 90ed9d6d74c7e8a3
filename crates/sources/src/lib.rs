//! skyboard-sources: Built-in data sources for skyboard.

mod json_file;
mod simulated;

pub use json_file::{JsonFileConfig, JsonFileSource};
pub use simulated::{SimulatedConfig, SimulatedStation};

use skyboard_core::{register_source, SourceCatalog, SourceEntry, SourceSettings};

/// Register all built-in sources with `catalog`
pub fn register_all(catalog: &mut SourceCatalog) {
    register_source!(catalog, "simulated", "Simulated Station", SimulatedStation);

    // Needs a path and schema, so it stays off until configured
    catalog.add(
        SourceEntry::new("json_file", "JSON File", || Box::new(JsonFileSource::new()))
            .with_defaults(SourceSettings {
                enabled: false,
                ..SourceSettings::default()
            }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut catalog = SourceCatalog::new();
        register_all(&mut catalog);
        assert_eq!(catalog.ids(), vec!["simulated", "json_file"]);
        assert!(catalog.get("json_file").unwrap().default_settings.is_some());
    }
}
