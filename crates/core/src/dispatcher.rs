//! Multi-source dispatch
//!
//! The dispatcher keeps one [`LogicalValue`] per key ever observed. Every
//! write goes through a single actor task fed by an unbounded channel, so
//! contributions for one key are never mutated concurrently. Readers load
//! the cached preferred resolution through an `ArcSwap` and never wait on a
//! source.
//!
//! Preferred source, first match wins:
//!
//! 1. an explicit selector given by the caller
//! 2. a running contributor configured as default provider for the key's
//!    category (longest matching prefix, then registration order)
//! 3. the first running contributor in registration order
//! 4. with nothing running, the most recent value from any contributor,
//!    flagged stale

use arc_swap::{ArcSwap, ArcSwapOption};
use skyboard_types::{CategoryKey, Measurement, SourceSelector};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::constants::NEW_KEY_CHANNEL_CAPACITY;
use crate::error::SchemaError;
use crate::observation::Snapshot;

/// Message from a source handle (or a caller) to the dispatcher actor
#[derive(Debug)]
pub enum DispatchEvent {
    /// A source was connected
    Registered {
        source: Arc<str>,
        order: usize,
        default_for: Vec<CategoryKey>,
        running: bool,
    },
    /// A source's worker started or stopped
    Running { source: Arc<str>, running: bool },
    /// A source's default-provider prefixes changed
    DefaultFor {
        source: Arc<str>,
        prefixes: Vec<CategoryKey>,
    },
    /// A source installed a new snapshot
    Observation {
        source: Arc<str>,
        snapshot: Arc<Snapshot>,
    },
    /// Barrier: answered once every earlier message has been applied
    Flush(oneshot::Sender<()>),
}

/// The value chosen to answer a read
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: CategoryKey,
    pub source: Arc<str>,
    pub measurement: Measurement,
    /// Set when the answering source is not running
    pub stale: bool,
}

type ChangeCallback = Arc<dyn Fn(&Resolution) + Send + Sync>;
type NewKeyCallback = Arc<dyn Fn(&CategoryKey) + Send + Sync>;

#[derive(Debug, Clone)]
struct SourceInfo {
    name: Arc<str>,
    order: usize,
    default_for: Vec<CategoryKey>,
    running: bool,
}

impl SourceInfo {
    /// Length of the longest default prefix covering `key`
    fn default_depth(&self, key: &CategoryKey) -> Option<usize> {
        self.default_for
            .iter()
            .filter(|prefix| key.starts_with(prefix))
            .map(CategoryKey::len)
            .max()
    }
}

/// Registered sources in registration order
#[derive(Debug, Clone, Default)]
struct SourceTable {
    entries: Vec<SourceInfo>,
}

impl SourceTable {
    fn get(&self, name: &str) -> Option<&SourceInfo> {
        self.entries.iter().find(|info| &*info.name == name)
    }

    fn is_running(&self, name: &str) -> bool {
        self.get(name).is_some_and(|info| info.running)
    }

    fn order(&self, name: &str) -> usize {
        self.get(name).map(|info| info.order).unwrap_or(usize::MAX)
    }

    fn upsert(&mut self, info: SourceInfo) {
        match self.entries.iter_mut().find(|e| e.name == info.name) {
            Some(existing) => *existing = info,
            None => self.entries.push(info),
        }
        self.entries.sort_by_key(|e| e.order);
    }
}

/// Resolve `key` from its current contributions. Pure: depends only on the
/// contributions and the source table, never on delivery order.
fn resolve(
    key: &CategoryKey,
    contributions: &HashMap<Arc<str>, Measurement>,
    table: &SourceTable,
    selector: &SourceSelector,
) -> Option<Resolution> {
    let answer = |source: &Arc<str>, measurement: &Measurement, stale: bool| Resolution {
        key: key.clone(),
        source: Arc::clone(source),
        measurement: measurement.clone(),
        stale,
    };

    if let SourceSelector::Named(name) = selector {
        let (source, measurement) = contributions.get_key_value(&**name)?;
        return Some(answer(source, measurement, !table.is_running(source)));
    }

    let running: Vec<&SourceInfo> = table
        .entries
        .iter()
        .filter(|info| info.running && contributions.contains_key(&info.name))
        .collect();

    if let Some(&first) = running.first() {
        let chosen = running
            .iter()
            .filter_map(|info| info.default_depth(key).map(|depth| (depth, *info)))
            .max_by(|(a_depth, a), (b_depth, b)| a_depth.cmp(b_depth).then(b.order.cmp(&a.order)))
            .map(|(_, info)| info)
            .unwrap_or(first);
        let measurement = contributions.get(&chosen.name)?;
        return Some(answer(&chosen.name, measurement, false));
    }

    contributions
        .iter()
        .max_by(|(a_name, a), (b_name, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| table.order(b_name).cmp(&table.order(a_name)))
        })
        .map(|(source, measurement)| answer(source, measurement, true))
}

/// Everyone following one key through one selector
struct Followers {
    /// Resolution last delivered to this selector
    last: Option<Resolution>,
    changed: watch::Sender<u64>,
    callbacks: Vec<ChangeCallback>,
}

impl Followers {
    fn new(last: Option<Resolution>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            last,
            changed,
            callbacks: Vec::new(),
        }
    }
}

/// The dispatcher's merged view of one key
pub struct LogicalValue {
    key: CategoryKey,
    contributions: RwLock<HashMap<Arc<str>, Measurement>>,
    preferred: ArcSwapOption<Resolution>,
    followers: Mutex<HashMap<SourceSelector, Followers>>,
}

impl LogicalValue {
    fn new(key: CategoryKey) -> Self {
        Self {
            key,
            contributions: RwLock::new(HashMap::new()),
            preferred: ArcSwapOption::empty(),
            followers: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &CategoryKey {
        &self.key
    }

    /// Cached resolution with no source preference
    pub fn preferred(&self) -> Option<Arc<Resolution>> {
        self.preferred.load_full()
    }

    fn resolve(&self, table: &SourceTable, selector: &SourceSelector) -> Option<Resolution> {
        if selector.is_any() {
            return self.preferred().map(|r| (*r).clone());
        }
        let contributions = self.contributions.read().unwrap_or_else(|e| e.into_inner());
        resolve(&self.key, &contributions, table, selector)
    }

    /// Run `update` on the followers of `selector`, creating them with the
    /// current resolution as baseline
    fn with_followers<R>(
        &self,
        table: &SourceTable,
        selector: &SourceSelector,
        update: impl FnOnce(&mut Followers) -> R,
    ) -> R {
        let mut followers = self.followers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = match followers.entry(selector.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Followers::new(self.resolve(table, selector))),
        };
        update(entry)
    }
}

struct Shared {
    values: RwLock<HashMap<CategoryKey, Arc<LogicalValue>>>,
    sources: ArcSwap<SourceTable>,
    new_keys: broadcast::Sender<CategoryKey>,
    new_key_callbacks: Mutex<Vec<NewKeyCallback>>,
}

impl Shared {
    fn value(&self, key: &CategoryKey) -> Option<Arc<LogicalValue>> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Fetch or create the LogicalValue for `key`, announcing it when new
    fn value_or_create(&self, key: &CategoryKey) -> Arc<LogicalValue> {
        if let Some(value) = self.value(key) {
            return value;
        }

        let (value, created) = {
            let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
            match values.entry(key.clone()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let value = Arc::new(LogicalValue::new(key.clone()));
                    entry.insert(Arc::clone(&value));
                    (value, true)
                }
            }
        };
        if created {
            self.announce(key);
        }
        value
    }

    fn announce(&self, key: &CategoryKey) {
        log::debug!("New key {}", key);
        // no receivers is fine
        let _ = self.new_keys.send(key.clone());
        // outside the lock; callbacks may register callbacks
        let callbacks: Vec<NewKeyCallback> = self
            .new_key_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            callback(key);
        }
    }

    fn update_table(&self, update: impl FnOnce(&mut SourceTable)) {
        let mut table = (**self.sources.load()).clone();
        update(&mut table);
        self.sources.store(Arc::new(table));
    }

    fn apply(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Registered {
                source,
                order,
                default_for,
                running,
            } => {
                log::debug!("Dispatcher: source '{}' registered (order {})", source, order);
                self.update_table(|table| {
                    table.upsert(SourceInfo {
                        name: Arc::clone(&source),
                        order,
                        default_for,
                        running,
                    })
                });
                self.recompute_for(&source);
            }
            DispatchEvent::Running { source, running } => {
                self.update_table(|table| {
                    if let Some(info) = table.entries.iter_mut().find(|e| e.name == source) {
                        info.running = running;
                    }
                });
                self.recompute_for(&source);
            }
            DispatchEvent::DefaultFor { source, prefixes } => {
                self.update_table(|table| {
                    if let Some(info) = table.entries.iter_mut().find(|e| e.name == source) {
                        info.default_for = prefixes;
                    }
                });
                self.recompute_for(&source);
            }
            DispatchEvent::Observation { source, snapshot } => {
                log::trace!(
                    "Dispatcher: {} values from '{}' (#{})",
                    snapshot.len(),
                    source,
                    snapshot.sequence
                );
                for (key, measurement) in &snapshot.values {
                    let value = self.value_or_create(key);
                    value
                        .contributions
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(Arc::clone(&source), measurement.clone());
                    self.recompute(&value);
                }
            }
            DispatchEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn recompute_for(&self, source: &str) {
        let affected: Vec<Arc<LogicalValue>> = self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|value| {
                value
                    .contributions
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains_key(source)
            })
            .cloned()
            .collect();
        for value in affected {
            self.recompute(&value);
        }
    }

    /// Refresh the cached preferred resolution and notify the followers of
    /// every selector whose resolution differs from the last one they saw
    fn recompute(&self, value: &LogicalValue) {
        let table = self.sources.load();
        let resolved = {
            let contributions = value.contributions.read().unwrap_or_else(|e| e.into_inner());
            resolve(&value.key, &contributions, &table, &SourceSelector::Any)
        };
        if value.preferred.load().as_deref() != resolved.as_ref() {
            value.preferred.store(resolved.clone().map(Arc::new));
        }

        let mut pending: Vec<(Resolution, Vec<ChangeCallback>)> = Vec::new();
        {
            let mut followers = value.followers.lock().unwrap_or_else(|e| e.into_inner());
            for (selector, entry) in followers.iter_mut() {
                let current = if selector.is_any() {
                    resolved.clone()
                } else {
                    value.resolve(&table, selector)
                };
                if current == entry.last {
                    continue;
                }
                entry.last = current.clone();
                entry.changed.send_modify(|generation| *generation += 1);
                if let Some(resolution) = current {
                    if !entry.callbacks.is_empty() {
                        pending.push((resolution, entry.callbacks.clone()));
                    }
                }
            }
        }

        for (resolution, callbacks) in pending {
            for callback in callbacks {
                callback(&resolution);
            }
        }
    }
}

async fn run(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = events.recv().await {
        shared.apply(event);
    }
    log::debug!("Dispatcher stopped: all senders dropped");
}

/// Receiver for one key's value changes
pub struct Subscription {
    value: Arc<LogicalValue>,
    selector: SourceSelector,
    shared: Arc<Shared>,
    receiver: watch::Receiver<u64>,
}

impl Subscription {
    pub fn key(&self) -> &CategoryKey {
        &self.value.key
    }

    pub fn selector(&self) -> &SourceSelector {
        &self.selector
    }

    /// Current resolution, `None` while nothing has been published
    pub fn current(&self) -> Option<Resolution> {
        self.value.resolve(&self.shared.sources.load(), &self.selector)
    }

    /// Wait for the next change and return the resolution after it
    pub async fn changed(&mut self) -> Option<Resolution> {
        self.receiver.changed().await.ok()?;
        self.current()
    }
}

/// Handle to the dispatcher actor; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<DispatchEvent>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start the actor on `runtime`
    pub fn spawn(runtime: &Handle) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let (new_keys, _) = broadcast::channel(NEW_KEY_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            values: RwLock::new(HashMap::new()),
            sources: ArcSwap::from_pointee(SourceTable::default()),
            new_keys,
            new_key_callbacks: Mutex::new(Vec::new()),
        });
        runtime.spawn(run(Arc::clone(&shared), events));
        Self { sender, shared }
    }

    /// Start the actor on the current runtime. Panics outside a tokio runtime.
    pub fn start() -> Self {
        Self::spawn(&Handle::current())
    }

    /// Channel into the actor, for source handles
    pub fn sender(&self) -> mpsc::UnboundedSender<DispatchEvent> {
        self.sender.clone()
    }

    /// Queue an event; dropped silently once the actor is gone
    pub fn send(&self, event: DispatchEvent) {
        if self.sender.send(event).is_err() {
            log::warn!("Dispatcher is not running, event dropped");
        }
    }

    /// Subscribe to a source handle's snapshots
    pub fn connect_source(&self, handle: &crate::handle::SourceHandle) {
        handle.connect(self.sender());
    }

    /// Resolves once every event queued before this call has been applied
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(DispatchEvent::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Split a possibly source-tagged key into plain key and selector
    fn target(key: &CategoryKey, selector: SourceSelector) -> (CategoryKey, SourceSelector) {
        match key.source() {
            Some(source) => (key.without_source(), SourceSelector::from(source)),
            None => (key.clone(), selector),
        }
    }

    /// Current value of `key` with no source preference. A source-tagged key
    /// reads that source's contribution.
    pub fn get(&self, key: &CategoryKey) -> Result<Resolution, SchemaError> {
        self.get_from(key, SourceSelector::Any)
    }

    /// Current value of `key` as answered by `selector`
    pub fn get_from(
        &self,
        key: &CategoryKey,
        selector: SourceSelector,
    ) -> Result<Resolution, SchemaError> {
        let (key, selector) = Self::target(key, selector);
        self.shared
            .value(&key)
            .and_then(|value| value.resolve(&self.shared.sources.load(), &selector))
            .ok_or(SchemaError::KeyNotFound(key))
    }

    /// Source currently answering `key`
    pub fn preferred_source(&self, key: &CategoryKey) -> Option<Arc<str>> {
        self.shared
            .value(key)
            .and_then(|value| value.preferred())
            .map(|resolution| Arc::clone(&resolution.source))
    }

    /// Follow `key` with no source preference
    pub fn subscribe(&self, key: &CategoryKey) -> Subscription {
        self.subscribe_from(key, SourceSelector::Any)
    }

    /// Follow `key` as answered by `selector`. Creates the key's LogicalValue
    /// (and announces it) if it does not exist yet.
    pub fn subscribe_from(&self, key: &CategoryKey, selector: SourceSelector) -> Subscription {
        let (key, selector) = Self::target(key, selector);
        let value = self.shared.value_or_create(&key);
        let receiver = value.with_followers(&self.shared.sources.load(), &selector, |followers| {
            followers.changed.subscribe()
        });
        Subscription {
            value,
            selector,
            shared: Arc::clone(&self.shared),
            receiver,
        }
    }

    /// Run `callback` on the dispatcher task after every change of `key`
    pub fn on_change<F>(&self, key: &CategoryKey, selector: SourceSelector, callback: F)
    where
        F: Fn(&Resolution) + Send + Sync + 'static,
    {
        let (key, selector) = Self::target(key, selector);
        let value = self.shared.value_or_create(&key);
        value.with_followers(&self.shared.sources.load(), &selector, |followers| {
            followers.callbacks.push(Arc::new(callback))
        });
    }

    /// Receive every key the first time a LogicalValue is created for it
    pub fn subscribe_new_keys(&self) -> broadcast::Receiver<CategoryKey> {
        self.shared.new_keys.subscribe()
    }

    /// Callback form of [`Dispatcher::subscribe_new_keys`]
    pub fn on_new_key<F>(&self, callback: F)
    where
        F: Fn(&CategoryKey) + Send + Sync + 'static,
    {
        self.shared
            .new_key_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Connected sources in registration order
    pub fn list_sources(&self) -> Vec<Arc<str>> {
        self.shared
            .sources
            .load()
            .entries
            .iter()
            .map(|info| Arc::clone(&info.name))
            .collect()
    }

    /// Every key with a LogicalValue, sorted
    pub fn known_keys(&self) -> Vec<CategoryKey> {
        let mut keys: Vec<CategoryKey> = self
            .shared
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Sources with a contribution for `key`, in registration order
    pub fn contributors(&self, key: &CategoryKey) -> Vec<Arc<str>> {
        let Some(value) = self.shared.value(&key.without_source()) else {
            return Vec::new();
        };
        let table = self.shared.sources.load();
        let mut sources: Vec<Arc<str>> = value
            .contributions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        sources.sort_by_key(|name| (table.order(name), name.clone()));
        sources
    }
}
