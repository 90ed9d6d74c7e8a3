//! Source discovery and the registry of loaded sources
//!
//! Built-in sources register a factory in a [`SourceCatalog`]; the
//! [`SourceRegistry`] turns catalog entries into running [`SourceHandle`]s and
//! connects each of them to the dispatcher. A source that fails to load is
//! logged and skipped, never fatal to the others.

use skyboard_types::{SourceSelector, SourceSettings, UnitSystem};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;

use crate::data_source::BoxedDataSource;
use crate::derived;
use crate::dispatcher::Dispatcher;
use crate::error::PluginError;
use crate::handle::{SourceHandle, SourceState};
use crate::schema::SchemaStore;

/// Function that creates a data source
pub type SourceFactory = fn() -> BoxedDataSource;

/// One discoverable source
#[derive(Clone)]
pub struct SourceEntry {
    /// Registry name, also the source tag of its keys
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Entry point; a source without one is skipped with `MissingDeclaration`
    pub factory: Option<SourceFactory>,
    /// Statically disabled sources are skipped with `SourceDisabled`
    pub disabled: bool,
    /// Used when the configuration has no entry for this source
    pub default_settings: Option<SourceSettings>,
}

impl SourceEntry {
    pub fn new(id: &str, name: &str, factory: SourceFactory) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            factory: Some(factory),
            disabled: false,
            default_settings: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn with_defaults(mut self, settings: SourceSettings) -> Self {
        self.default_settings = Some(settings);
        self
    }
}

/// Candidate sources in registration order
#[derive(Clone, Default)]
pub struct SourceCatalog {
    entries: Vec<SourceEntry>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry; a replaced entry keeps its position
    pub fn add(&mut self, entry: SourceEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Register a source factory
    pub fn register(&mut self, id: &str, name: &str, factory: SourceFactory) {
        self.add(SourceEntry::new(id, name, factory));
    }

    pub fn get(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Macro to register a data source type with a catalog
#[macro_export]
macro_rules! register_source {
    ($catalog:expr, $id:expr, $name:expr, $type:ty) => {
        $catalog.register($id, $name, || Box::new(<$type>::default()))
    };
}

/// Outcome of [`SourceRegistry::load_all`]
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<(String, PluginError)>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Loaded sources, in load order
pub struct SourceRegistry {
    handles: RwLock<Vec<Arc<SourceHandle>>>,
    dispatcher: Dispatcher,
    schema_store: Arc<SchemaStore>,
    runtime: Handle,
    units: UnitSystem,
    network_available: AtomicBool,
}

impl SourceRegistry {
    pub fn new(dispatcher: Dispatcher, runtime: Handle, units: UnitSystem) -> Self {
        let schema_store = SchemaStore::new();
        schema_store.extend(derived::descriptors().into_iter().map(Arc::new));
        Self {
            handles: RwLock::new(Vec::new()),
            dispatcher,
            schema_store,
            runtime,
            units,
            network_available: AtomicBool::new(true),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Every key any loaded source can publish
    pub fn schema_store(&self) -> &Arc<SchemaStore> {
        &self.schema_store
    }

    pub fn units(&self) -> UnitSystem {
        self.units
    }

    /// Load every catalog entry, continuing past failures
    pub fn load_all(
        &self,
        catalog: &SourceCatalog,
        settings: &HashMap<String, SourceSettings>,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for entry in catalog.entries() {
            let entry_settings = settings
                .get(&entry.id)
                .or(entry.default_settings.as_ref())
                .cloned()
                .unwrap_or_default();
            match self.load(entry, &entry_settings) {
                Ok(handle) => report.loaded.push(handle.name().to_string()),
                Err(e) => {
                    log::warn!("Skipping source '{}': {}", entry.id, e);
                    report.skipped.push((entry.id.clone(), e));
                }
            }
        }
        log::info!(
            "Loaded {} sources ({} skipped), {} known keys",
            report.loaded.len(),
            report.skipped.len(),
            self.schema_store.len()
        );
        report
    }

    /// Load one entry and connect it to the dispatcher. Loading a name that is
    /// already loaded returns the existing handle; an unloaded one is replaced.
    pub fn load(
        &self,
        entry: &SourceEntry,
        settings: &SourceSettings,
    ) -> Result<Arc<SourceHandle>, PluginError> {
        if entry.disabled {
            return Err(PluginError::SourceDisabled(entry.id.clone()));
        }
        let factory = entry
            .factory
            .ok_or_else(|| PluginError::MissingDeclaration(entry.id.clone()))?;

        if let Some(existing) = self.get(&entry.id) {
            if existing.state() != SourceState::Unloaded {
                log::debug!("Source '{}' is already loaded", entry.id);
                return Ok(existing);
            }
        }

        let source = panic::catch_unwind(AssertUnwindSafe(factory)).map_err(|payload| {
            PluginError::load(
                &entry.id,
                anyhow::anyhow!("constructor panicked: {}", panic_message(&*payload)),
            )
        })?;

        let order = {
            let handles = self.handles.read().unwrap_or_else(|e| e.into_inner());
            handles
                .iter()
                .position(|h| h.name() == entry.id)
                .unwrap_or(handles.len())
        };
        let handle = panic::catch_unwind(AssertUnwindSafe(|| {
            SourceHandle::load(&entry.id, order, source, settings, self.units)
        }))
        .map_err(|payload| {
            PluginError::load(
                &entry.id,
                anyhow::anyhow!("load panicked: {}", panic_message(&*payload)),
            )
        })??;
        let handle = Arc::new(handle);

        {
            let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
            match handles.iter().position(|h| h.name() == entry.id) {
                Some(index) => handles[index] = Arc::clone(&handle),
                None => handles.push(Arc::clone(&handle)),
            }
        }

        let added = self.schema_store.extend(handle.descriptors());
        self.schema_store.refresh();
        log::debug!("Source '{}' added {} keys to the schema", entry.id, added);

        self.dispatcher.connect_source(&handle);
        Ok(handle)
    }

    /// Start every enabled source that is not running yet
    pub fn start_all(&self) -> usize {
        if !self.network_available.load(Ordering::SeqCst) {
            log::info!("Network unavailable, not starting sources");
            return 0;
        }
        self.iter()
            .filter(|handle| handle.is_enabled() && !handle.is_running())
            .filter(|handle| handle.start(&self.runtime))
            .count()
    }

    pub fn stop_all(&self) -> usize {
        self.iter()
            .filter(|handle| handle.is_enabled())
            .filter(|handle| handle.stop())
            .count()
    }

    pub fn start(&self, name: &str) -> bool {
        self.get(name)
            .map(|handle| handle.start(&self.runtime))
            .unwrap_or(false)
    }

    pub fn stop(&self, name: &str) -> bool {
        self.get(name).map(|handle| handle.stop()).unwrap_or(false)
    }

    /// Toggle a source at runtime; enabling starts it when the network is up
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };
        handle.set_enabled(enabled);
        if enabled && self.network_available.load(Ordering::SeqCst) {
            handle.start(&self.runtime);
        }
        true
    }

    pub fn set_default_for(&self, name: &str, prefixes: &[String]) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };
        handle.set_default_for(prefixes);
        true
    }

    /// Record a connectivity change; going online starts every enabled source
    pub fn set_network_available(&self, available: bool) {
        let was = self.network_available.swap(available, Ordering::SeqCst);
        if was == available {
            return;
        }
        if available {
            let started = self.start_all();
            log::info!("Network available, started {} sources", started);
        } else {
            log::info!("Network unavailable");
        }
    }

    pub fn is_network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    pub fn unload(&self, name: &str) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };
        handle.unload();
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<SourceHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    /// Handles answering `selector`; every loaded source for "any"
    pub fn select(&self, selector: &SourceSelector) -> Vec<Arc<SourceHandle>> {
        match selector.name() {
            None => self.iter().collect(),
            Some(name) => self.get(name).into_iter().collect(),
        }
    }

    /// Snapshot of the loaded handles, in load order
    pub fn iter(&self) -> impl Iterator<Item = Arc<SourceHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .into_iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|handle| handle.name().to_string()).collect()
    }

    /// Whether `name` is loaded; the "any source" token is always accepted
    pub fn contains(&self, name: &str) -> bool {
        SourceSelector::from(name).is_any() || self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
