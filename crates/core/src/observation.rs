//! Per-source containers of converted measurements
//!
//! Both shapes are written only by their source's worker and read by anyone.
//! Each update builds a complete new value off to the side and installs it
//! with one `ArcSwap` store, so a reader sees either the previous batch or
//! the new one, never a mix.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::{Map, Value};
use skyboard_types::{CategoryKey, Measurement, Value as Converted};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::ACCUMULATION_SEGMENT;
use crate::derived;
use crate::translator::Translator;

/// One installed batch of values
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Record time; `None` only for the empty initial snapshot
    pub timestamp: Option<DateTime<Utc>>,
    pub values: HashMap<CategoryKey, Measurement>,
    /// Increases by one with every install
    pub sequence: u64,
}

impl Snapshot {
    pub fn get(&self, key: &CategoryKey) -> Option<&Measurement> {
        self.values.get(&key.without_source())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Current values of a realtime source
pub struct RealtimeObservation {
    current: ArcSwap<Snapshot>,
    sequence: AtomicU64,
}

impl Default for RealtimeObservation {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            sequence: AtomicU64::new(0),
        }
    }
}

impl RealtimeObservation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last installed snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn get(&self, key: &CategoryKey) -> Option<Measurement> {
        self.current.load().get(key).cloned()
    }

    /// Translate `raw`, derive dependent fields from that batch alone, then
    /// replace the current snapshot wholesale
    pub fn update(
        &self,
        translator: &Translator,
        raw: &Map<String, Value>,
        received: DateTime<Utc>,
    ) -> Arc<Snapshot> {
        let batch = translator.ingest(raw, received);
        let mut values = batch.values;
        derived::derive(&mut values, translator.units());
        self.install(batch.timestamp.unwrap_or(received), values)
    }

    /// Install an already converted batch
    pub fn install(
        &self,
        timestamp: DateTime<Utc>,
        values: HashMap<CategoryKey, Measurement>,
    ) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot {
            timestamp: Some(timestamp),
            values,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        });
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }
}

/// Time-indexed forecast records
#[derive(Debug, Clone, Default)]
pub struct ForecastSeries {
    records: BTreeMap<DateTime<Utc>, HashMap<CategoryKey, Measurement>>,
    period: Option<Duration>,
}

impl ForecastSeries {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Typical spacing between records (median gap)
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.records.keys()
    }

    /// Latest record at or before `now`, else the earliest one
    pub fn current(
        &self,
        now: DateTime<Utc>,
    ) -> Option<(&DateTime<Utc>, &HashMap<CategoryKey, Measurement>)> {
        self.records
            .range(..=now)
            .next_back()
            .or_else(|| self.records.iter().next())
    }

    /// Record at `timestamp` (truncated to the minute)
    pub fn at(&self, timestamp: DateTime<Utc>) -> Option<&HashMap<CategoryKey, Measurement>> {
        self.records.get(&truncate_to_minute(timestamp))
    }

    /// Records with `from <= t < to`, in time order
    pub fn range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = (&DateTime<Utc>, &HashMap<CategoryKey, Measurement>)> {
        let to = to.max(from);
        self.records.range(from..to)
    }
}

fn truncate_to_minute(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(timestamp)
}

fn median_gap(records: &BTreeMap<DateTime<Utc>, HashMap<CategoryKey, Measurement>>) -> Option<Duration> {
    let times: Vec<&DateTime<Utc>> = records.keys().collect();
    let mut gaps: Vec<Duration> = times.windows(2).map(|w| *w[1] - *w[0]).collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort();
    Some(gaps[gaps.len() / 2])
}

/// Companion key holding the running total of `key`
pub fn accumulation_key(key: &CategoryKey) -> CategoryKey {
    key.sibling(ACCUMULATION_SEGMENT)
        .unwrap_or_else(|_| key.clone())
}

/// Forecast records of one source
pub struct ForecastObservation {
    series: ArcSwap<ForecastSeries>,
    accumulating: Vec<CategoryKey>,
}

impl ForecastObservation {
    /// `accumulating` lists the keys whose descriptors ask for a running total
    pub fn new(accumulating: Vec<CategoryKey>) -> Self {
        Self {
            series: ArcSwap::from_pointee(ForecastSeries::default()),
            accumulating,
        }
    }

    pub fn series(&self) -> Arc<ForecastSeries> {
        self.series.load_full()
    }

    pub fn accumulating(&self) -> &[CategoryKey] {
        &self.accumulating
    }

    /// Merge a batch of raw records into the series.
    ///
    /// Records are keyed by their minute-truncated timestamp; a record for a
    /// time already present is merged field by field. The period estimate and
    /// every running accumulation are recomputed over the whole series.
    pub fn update(
        &self,
        translator: &Translator,
        raws: &[Map<String, Value>],
        received: DateTime<Utc>,
    ) -> Arc<ForecastSeries> {
        let mut records = self.series.load().records.clone();
        for raw in raws {
            let batch = translator.ingest(raw, received);
            if batch.is_empty() {
                continue;
            }
            let at = truncate_to_minute(batch.timestamp.unwrap_or(received));
            records.entry(at).or_default().extend(batch.values);
        }

        self.accumulate(&mut records);
        let series = Arc::new(ForecastSeries {
            period: median_gap(&records),
            records,
        });
        log::debug!(
            "Forecast for '{}' now has {} records (period {:?})",
            translator.source(),
            series.len(),
            series.period.map(|p| p.num_minutes())
        );
        self.series.store(Arc::clone(&series));
        series
    }

    fn accumulate(&self, records: &mut BTreeMap<DateTime<Utc>, HashMap<CategoryKey, Measurement>>) {
        for key in &self.accumulating {
            let total_key = accumulation_key(key);
            let mut total = 0.0;
            for values in records.values_mut() {
                let Some(measurement) = values.get(key) else {
                    values.remove(&total_key);
                    continue;
                };
                let Converted::Number(amount) = measurement.value else {
                    continue;
                };
                total += amount;
                let running = Measurement {
                    value: Converted::Number(total),
                    ..measurement.clone()
                };
                values.insert(total_key.clone(), running);
            }
        }
    }
}
