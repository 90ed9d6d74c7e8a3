//! Source lifecycle
//!
//! A `SourceHandle` wraps one loaded [`DataSource`] with its translator,
//! observations and polling worker. Handles live as long as the registry;
//! removing a source moves its handle to [`SourceState::Unloaded`] instead
//! of dropping it, since subscribers and the dispatcher may still refer to
//! its name.
//!
//! ```text
//! Discovered -> Loaded -> Disabled <-> Enabled -> Running <-> Stopped
//!                                any state -> Unloaded
//! ```

use chrono::Utc;
use serde_json::{Map, Value};
use skyboard_types::{CategoryKey, SourceSettings, UnitSystem};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::constants::{FORECAST_REFRESH_INTERVAL, MIN_POLL_INTERVAL};
use crate::data_source::{BoxedDataSource, SourceMetadata};
use crate::dispatcher::DispatchEvent;
use crate::error::PluginError;
use crate::observation::{accumulation_key, ForecastObservation, RealtimeObservation, Snapshot};
use crate::schema::{FieldDescriptor, Schema, StaticProperties};
use crate::translator::Translator;

/// Lifecycle state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Discovered,
    Loaded,
    Disabled,
    Enabled,
    Running,
    Stopped,
    Unloaded,
}

impl SourceState {
    /// Enabled, whether or not the worker is currently running
    pub fn is_enabled(self) -> bool {
        matches!(
            self,
            SourceState::Enabled | SourceState::Running | SourceState::Stopped
        )
    }
}

struct Lifecycle {
    state: SourceState,
    stop: Option<watch::Sender<bool>>,
}

/// One loaded source and its worker
pub struct SourceHandle {
    name: Arc<str>,
    order: usize,
    metadata: SourceMetadata,
    source: Arc<Mutex<BoxedDataSource>>,
    translator: Arc<Translator>,
    realtime: RealtimeObservation,
    forecast: Option<ForecastObservation>,
    interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    default_for: RwLock<Vec<CategoryKey>>,
    sinks: Mutex<Vec<mpsc::UnboundedSender<DispatchEvent>>>,
}

fn parse_prefixes(name: &str, prefixes: &[String]) -> Vec<CategoryKey> {
    prefixes
        .iter()
        .filter_map(|prefix| match CategoryKey::parse(prefix) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("Source '{}': ignoring default prefix: {}", name, e);
                None
            }
        })
        .collect()
}

impl SourceHandle {
    /// Configure `source` and build its translator.
    ///
    /// The handle starts `Enabled` or `Disabled` according to `settings`; no
    /// worker is started.
    pub fn load(
        name: &str,
        order: usize,
        mut source: BoxedDataSource,
        settings: &SourceSettings,
        units: UnitSystem,
    ) -> Result<Self, PluginError> {
        log::debug!("Loading source '{}'", name);
        if !source.is_available() {
            return Err(PluginError::load(
                name,
                anyhow::anyhow!("not available on this system"),
            ));
        }
        source
            .configure(&settings.settings)
            .map_err(|e| PluginError::load(name, e))?;

        let schema =
            Schema::from_value(&source.schema()).map_err(|e| PluginError::load(name, e))?;

        // Computed properties are fixed once the source is configured
        let mut properties = StaticProperties::new();
        for property in schema.computed_properties() {
            match source.property(&property) {
                Some(value) => properties.insert(property, value),
                None => log::warn!("Source '{}' does not provide property '@{}'", name, property),
            }
        }

        let translator = Translator::new(name, schema, Arc::new(properties), units);
        let metadata = source.metadata().clone();
        let forecast = metadata.provides_forecast.then(|| {
            let accumulating = translator
                .descriptors()
                .into_iter()
                .filter(|descriptor| descriptor.accumulate)
                .map(|descriptor| descriptor.key.clone())
                .collect();
            ForecastObservation::new(accumulating)
        });

        let interval = settings
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(metadata.default_interval)
            .max(MIN_POLL_INTERVAL);

        let state = if settings.enabled {
            SourceState::Enabled
        } else {
            SourceState::Disabled
        };
        log::info!(
            "Loaded source '{}' ({}), {} keys, every {:?}, {:?}",
            name,
            metadata.name,
            translator.keys().count(),
            interval,
            state
        );

        Ok(Self {
            name: Arc::from(name),
            order,
            metadata,
            source: Arc::new(Mutex::new(source)),
            translator: Arc::new(translator),
            realtime: RealtimeObservation::new(),
            forecast,
            interval,
            lifecycle: Mutex::new(Lifecycle { state, stop: None }),
            default_for: RwLock::new(parse_prefixes(name, &settings.default_for)),
            sinks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn realtime(&self) -> &RealtimeObservation {
        &self.realtime
    }

    pub fn forecast(&self) -> Option<&ForecastObservation> {
        self.forecast.as_ref()
    }

    pub fn state(&self) -> SourceState {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    pub fn default_for(&self) -> Vec<CategoryKey> {
        self.default_for
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Descriptors for every key this source can publish, including the
    /// running totals of accumulating forecast fields
    pub fn descriptors(&self) -> Vec<Arc<FieldDescriptor>> {
        let mut descriptors = self.translator.descriptors();
        if let Some(forecast) = &self.forecast {
            for key in forecast.accumulating() {
                if let Ok(base) = self.translator.descriptor(key) {
                    let total_key = accumulation_key(key);
                    descriptors.push(Arc::new(FieldDescriptor {
                        title: format!("{} Accumulation", base.title),
                        source_keys: Vec::new(),
                        key: total_key,
                        accumulate: false,
                        ..(*base).clone()
                    }));
                }
            }
        }
        descriptors
    }

    fn emit(&self, event: impl Fn() -> DispatchEvent) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.retain(|sink| sink.send(event()).is_ok());
    }

    /// Send this source's events to `sink`, starting with its registration
    /// and the current snapshot
    pub fn connect(&self, sink: mpsc::UnboundedSender<DispatchEvent>) {
        let registered = DispatchEvent::Registered {
            source: Arc::clone(&self.name),
            order: self.order,
            default_for: self.default_for(),
            running: self.is_running(),
        };
        if sink.send(registered).is_err() {
            return;
        }
        let snapshot = self.realtime.snapshot();
        if !snapshot.is_empty() {
            let _ = sink.send(DispatchEvent::Observation {
                source: Arc::clone(&self.name),
                snapshot,
            });
        }
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    fn publish(&self, snapshot: Arc<Snapshot>) {
        self.emit(|| DispatchEvent::Observation {
            source: Arc::clone(&self.name),
            snapshot: Arc::clone(&snapshot),
        });
    }

    /// Install a realtime record and publish it
    pub fn push(&self, raw: &Map<String, Value>) -> Arc<Snapshot> {
        let snapshot = self.realtime.update(&self.translator, raw, Utc::now());
        self.publish(Arc::clone(&snapshot));
        snapshot
    }

    /// Merge forecast records. A source with no realtime values publishes the
    /// forecast record for the current time instead.
    pub fn push_forecast(&self, records: &[Map<String, Value>], publish_current: bool) {
        let Some(forecast) = &self.forecast else {
            log::debug!("Source '{}' has no forecast, records dropped", self.name);
            return;
        };
        let now = Utc::now();
        let series = forecast.update(&self.translator, records, now);
        if !publish_current {
            return;
        }
        if let Some((at, values)) = series.current(now) {
            let snapshot = self.realtime.install(*at, values.clone());
            self.publish(snapshot);
        }
    }

    pub fn set_default_for(&self, prefixes: &[String]) {
        let keys = parse_prefixes(&self.name, prefixes);
        *self.default_for.write().unwrap_or_else(|e| e.into_inner()) = keys.clone();
        self.emit(|| DispatchEvent::DefaultFor {
            source: Arc::clone(&self.name),
            prefixes: keys.clone(),
        });
    }

    /// Start the polling worker. Returns whether the source is running
    /// afterwards; disabled and unloaded sources refuse to start.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match lifecycle.state {
            SourceState::Running => return true,
            SourceState::Enabled | SourceState::Stopped => {}
            state => {
                log::debug!("Not starting source '{}' in state {:?}", self.name, state);
                return false;
            }
        }

        let (stop, stopped) = watch::channel(false);
        runtime.spawn(Arc::clone(self).run(stopped));
        lifecycle.stop = Some(stop);
        lifecycle.state = SourceState::Running;
        drop(lifecycle);

        log::info!("Started source '{}' (every {:?})", self.name, self.interval);
        self.emit(|| DispatchEvent::Running {
            source: Arc::clone(&self.name),
            running: true,
        });
        true
    }

    /// Stop the worker at its next suspension point; the last snapshot stays
    /// visible. Returns whether a worker was stopped.
    pub fn stop(&self) -> bool {
        self.stop_into(SourceState::Stopped)
    }

    fn stop_into(&self, next: SourceState) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let was_running = lifecycle.state == SourceState::Running;
        if let Some(stop) = lifecycle.stop.take() {
            let _ = stop.send(true);
        }
        if was_running || next != SourceState::Stopped {
            lifecycle.state = next;
        }
        drop(lifecycle);

        if was_running {
            log::info!("Stopped source '{}'", self.name);
            self.emit(|| DispatchEvent::Running {
                source: Arc::clone(&self.name),
                running: false,
            });
        }
        was_running
    }

    /// Toggle without reloading the schema; disabling stops a running worker
    pub fn set_enabled(&self, enabled: bool) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let was_running = match (lifecycle.state, enabled) {
            (SourceState::Unloaded, _) => {
                log::warn!("Source '{}' is unloaded", self.name);
                return;
            }
            (SourceState::Disabled | SourceState::Loaded, true) => {
                lifecycle.state = SourceState::Enabled;
                log::info!("Enabled source '{}'", self.name);
                return;
            }
            (SourceState::Disabled, false) | (_, true) => return,
            (state, false) => {
                if let Some(stop) = lifecycle.stop.take() {
                    let _ = stop.send(true);
                }
                lifecycle.state = SourceState::Disabled;
                state == SourceState::Running
            }
        };
        drop(lifecycle);

        log::info!("Disabled source '{}'", self.name);
        if was_running {
            self.emit(|| DispatchEvent::Running {
                source: Arc::clone(&self.name),
                running: false,
            });
        }
    }

    /// Terminal state: worker stopped, snapshot kept, never starts again
    pub fn unload(&self) {
        self.stop_into(SourceState::Unloaded);
        log::info!("Unloaded source '{}'", self.name);
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_forecast = Instant::now();

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            let want_forecast = self.forecast.is_some() && Instant::now() >= next_forecast;
            if want_forecast {
                next_forecast = Instant::now() + FORECAST_REFRESH_INTERVAL;
            }

            // Fetching may block; the lock is only ever taken on the blocking pool
            let source = Arc::clone(&self.source);
            let fetched = tokio::task::spawn_blocking(move || {
                let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
                let realtime = source.fetch();
                let forecast = want_forecast.then(|| source.fetch_forecast());
                (realtime, forecast)
            })
            .await;

            let (realtime, forecast) = match fetched {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Source '{}' worker task failed: {}", self.name, e);
                    continue;
                }
            };

            // an empty record means the source only forecasts; a failed fetch
            // publishes nothing this tick
            let forecast_only = match realtime {
                Ok(raw) if raw.is_empty() => true,
                Ok(raw) => {
                    self.push(&raw);
                    false
                }
                Err(e) => {
                    log::warn!("Source '{}' fetch failed: {:#}", self.name, e);
                    false
                }
            };

            match forecast {
                Some(Ok(records)) => self.push_forecast(&records, forecast_only),
                Some(Err(e)) => log::warn!("Source '{}' forecast failed: {:#}", self.name, e),
                None => {
                    if forecast_only && self.forecast.is_some() {
                        self.push_forecast(&[], true);
                    }
                }
            }
        }
        log::debug!("Worker for '{}' exited", self.name);
    }
}
