//! Wiring of catalog, registry and dispatcher for the binary

use anyhow::Result;
use skyboard_core::{
    CategoryKey, Dispatcher, LoadReport, Resolution, SourceCatalog, SourceRegistry, SourceState,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

use crate::config::EngineConfig;

/// One loaded source as listed by `--list-sources`
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub name: String,
    pub description: String,
    pub state: SourceState,
    pub keys: usize,
}

/// A dispatcher and a registry loaded from configuration
pub struct Engine {
    dispatcher: Dispatcher,
    registry: Arc<SourceRegistry>,
    report: LoadReport,
}

impl Engine {
    /// Load every source in `catalog` with its configured settings.
    /// Sources are not started.
    pub fn new(config: &EngineConfig, catalog: &SourceCatalog, runtime: Handle) -> Self {
        let dispatcher = Dispatcher::spawn(&runtime);
        let registry = Arc::new(SourceRegistry::new(
            dispatcher.clone(),
            runtime,
            config.units,
        ));
        let report = registry.load_all(catalog, &config.sources);
        Self {
            dispatcher,
            registry,
            report,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn start(&self) -> usize {
        let started = self.registry.start_all();
        log::info!("Started {} of {} sources", started, self.registry.len());
        started
    }

    pub fn stop(&self) -> usize {
        self.registry.stop_all()
    }

    pub fn sources(&self) -> Vec<SourceSummary> {
        self.registry
            .iter()
            .map(|handle| SourceSummary {
                name: handle.name().to_string(),
                description: handle.metadata().description.clone(),
                state: handle.state(),
                keys: handle.translator().keys().count(),
            })
            .collect()
    }

    /// Every key a loaded source can publish, with its title
    pub fn keys(&self) -> Vec<(CategoryKey, String)> {
        let store = self.registry.schema_store();
        store
            .keys()
            .into_iter()
            .filter_map(|key| {
                let title = store.descriptor(&key)?.title.clone();
                Some((key, title))
            })
            .collect()
    }

    /// Print resolved values of `keys` as they change, or of every key when
    /// `keys` is empty, until `duration` elapses or Ctrl-C
    pub async fn watch(&self, keys: Vec<CategoryKey>, duration: Option<Duration>) -> Result<()> {
        let (printer, mut printed) = mpsc::unbounded_channel::<Resolution>();
        let all = keys.is_empty();
        let mut watched = HashSet::new();
        let mut new_keys = self.dispatcher.subscribe_new_keys();

        let initial = if all {
            self.dispatcher.known_keys()
        } else {
            keys
        };
        for key in initial {
            self.follow(&key, &mut watched, &printer);
        }

        let deadline = tokio::time::sleep(duration.unwrap_or(Duration::MAX / 4));
        tokio::pin!(deadline);
        let mut listening = all;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted");
                    break;
                }
                Some(resolution) = printed.recv() => print_resolution(&resolution),
                key = new_keys.recv(), if listening => match key {
                    Ok(key) => self.follow(&key, &mut watched, &printer),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} new keys, rescanning", missed);
                        for key in self.dispatcher.known_keys() {
                            self.follow(&key, &mut watched, &printer);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => listening = false,
                },
            }
        }
        Ok(())
    }

    fn follow(
        &self,
        key: &CategoryKey,
        watched: &mut HashSet<CategoryKey>,
        printer: &mpsc::UnboundedSender<Resolution>,
    ) {
        if !watched.insert(key.clone()) {
            return;
        }
        let mut subscription = self.dispatcher.subscribe(key);
        let printer = printer.clone();
        tokio::spawn(async move {
            if let Some(current) = subscription.current() {
                if printer.send(current).is_err() {
                    return;
                }
            }
            while let Some(resolution) = subscription.changed().await {
                if printer.send(resolution).is_err() {
                    break;
                }
            }
        });
    }
}

fn print_resolution(resolution: &Resolution) {
    println!(
        "{:<48} {:>20}  [{}]{}",
        resolution.key.to_string(),
        resolution.measurement.to_string(),
        resolution.source,
        if resolution.stale { " stale" } else { "" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_loads_builtins() {
        let mut catalog = SourceCatalog::new();
        skyboard_sources::register_all(&mut catalog);
        let engine = Engine::new(&EngineConfig::default(), &catalog, Handle::current());

        let names: Vec<_> = engine.sources().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["simulated", "json_file"]);
        assert!(engine.report().skipped.is_empty());

        let temperature = CategoryKey::parse("environment.temperature.temperature").unwrap();
        assert!(engine.keys().iter().any(|(key, _)| *key == temperature));
    }
}
