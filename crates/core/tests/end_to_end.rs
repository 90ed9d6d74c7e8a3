//! Multi-source scenarios across the translator, handles, and dispatcher

use anyhow::Result;
use serde_json::{json, Map, Value};
use skyboard_core::{
    BoxedDataSource, CategoryKey, DataSource, DescriptorCache, Dispatcher, NoProperties,
    RealtimeObservation, Resolution, Schema, SourceHandle, SourceMetadata, SourceSelector,
    SourceSettings, Translator, Unit, UnitSystem,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;

fn key(s: &str) -> CategoryKey {
    CategoryKey::parse(s).unwrap()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

/// Station whose values are pushed by the test; polling yields nothing
struct Station {
    metadata: SourceMetadata,
}

impl Station {
    fn boxed(id: &str) -> BoxedDataSource {
        Box::new(Self {
            metadata: SourceMetadata {
                id: id.to_string(),
                name: id.to_uppercase(),
                description: "Test station".to_string(),
                default_interval: Duration::from_secs(3600),
                provides_forecast: false,
            },
        })
    }
}

impl DataSource for Station {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn schema(&self) -> Value {
        json!({
            "environment.temperature.temperature": {
                "type": "temperature", "sourceUnit": "c", "sourceKey": ["temp", "air_temperature"]
            },
            "environment.humidity.humidity": { "type": "humidity", "sourceUnit": "%", "sourceKey": "rh" },
            "time.timestamp": { "type": "datetime", "sourceUnit": "epoch", "sourceKey": "time" }
        })
    }

    fn fetch(&mut self) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

fn station(name: &str, order: usize, default_for: &[&str]) -> Arc<SourceHandle> {
    let settings = SourceSettings {
        default_for: default_for.iter().map(|s| s.to_string()).collect(),
        ..SourceSettings::default()
    };
    let handle = SourceHandle::load(name, order, Station::boxed(name), &settings, UnitSystem::Metric)
        .unwrap();
    Arc::new(handle)
}

#[tokio::test]
async fn test_default_provider_then_fallback_then_stale() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dispatcher = Dispatcher::start();
    let a = station("a", 0, &["environment.temperature"]);
    let b = station("b", 1, &[]);
    dispatcher.connect_source(&a);
    dispatcher.connect_source(&b);
    a.start(&Handle::current());
    b.start(&Handle::current());

    // B reports first and more recently; A still wins as default provider
    b.push(&object(json!({ "temp": 18.0, "time": 2_000 })));
    a.push(&object(json!({ "temp": 20.0, "time": 1_000 })));
    dispatcher.flush().await;

    let temperature = key("environment.temperature.temperature");
    let resolved = dispatcher.get(&temperature).unwrap();
    assert_eq!(&*resolved.source, "a");
    assert!(!resolved.stale);

    a.stop();
    dispatcher.flush().await;
    let resolved = dispatcher.get(&temperature).unwrap();
    assert_eq!(&*resolved.source, "b");
    assert_eq!(resolved.measurement.as_f64(), Some(18.0));
    assert!(!resolved.stale);

    b.stop();
    dispatcher.flush().await;
    let resolved = dispatcher.get(&temperature).unwrap();
    assert_eq!(&*resolved.source, "b");
    assert!(resolved.stale);

    // both contributions are retained
    assert_eq!(dispatcher.contributors(&temperature).len(), 2);
    assert!(dispatcher.get(&key("environment.pressure.pressure")).is_err());
}

#[test]
fn test_inherited_unit_with_overridden_title() {
    let schema = Schema::from_value(&json!({
        "environment.pressure": { "type": "pressure", "sourceUnit": "mb" },
        "environment.pressure.absolute": { "title": "Station Pressure", "sourceKey": "pres" }
    }))
    .unwrap();
    let cache = DescriptorCache::new();
    let absolute = key("environment.pressure.absolute");

    let descriptor = cache.resolve(&schema, &absolute, &"any".into(), &NoProperties).unwrap();
    assert_eq!(descriptor.source_unit.as_deref(), Some("mb"));
    assert_eq!(descriptor.title, "Station Pressure");

    let again = cache.resolve(&schema, &absolute, &"any".into(), &NoProperties).unwrap();
    assert!(Arc::ptr_eq(&descriptor, &again));
}

#[test]
fn test_one_malformed_field_of_ten() {
    let schema = Schema::from_value(&json!({
        "environment.temperature.temperature": { "type": "temperature", "sourceUnit": "c", "sourceKey": "t" },
        "environment.humidity.humidity": { "type": "humidity", "sourceUnit": "%", "sourceKey": "rh" },
        "environment.pressure.pressure": { "type": "pressure", "sourceUnit": "hPa", "sourceKey": "p" },
        "environment.wind.speed": { "type": "speed", "sourceUnit": "m/s", "sourceKey": "ws" },
        "environment.wind.gust": { "type": "speed", "sourceUnit": "m/s", "sourceKey": "wg" },
        "environment.wind.direction": { "type": "direction", "sourceUnit": "deg", "sourceKey": "wd" },
        "environment.light.illuminance": { "type": "illuminance", "sourceUnit": "lux", "sourceKey": "lux" },
        "environment.light.uvi": { "type": "number", "sourceKey": "uv" },
        "device.battery": { "type": "voltage", "sourceUnit": "V", "sourceKey": "bat" },
        "environment.lightning.count": { "type": "count", "sourceKey": "strikes" }
    }))
    .unwrap();
    let translator = Translator::new("station", schema, Arc::new(NoProperties), UnitSystem::Metric);

    let raw = object(json!({
        "t": 21.0, "rh": 55, "p": 1013.2, "ws": 3.1, "wg": 5.2,
        "wd": "north-ish", "lux": 12000, "uv": 3.5, "bat": 2.6, "strikes": 0
    }));
    let batch = translator.ingest(&raw, chrono::Utc::now());

    assert_eq!(batch.len(), 9);
    assert_eq!(batch.failed.len(), 1);
    assert_eq!(batch.failed[0].field, "wd");
    assert!(batch.values.get(&key("environment.wind.direction")).is_none());
    assert_eq!(
        batch.values[&key("environment.pressure.pressure")].unit,
        Unit::Hectopascal
    );
}

#[test]
fn test_readers_never_see_mixed_batches() {
    let schema = Schema::from_value(&json!({
        "environment.temperature.temperature": { "type": "temperature", "sourceUnit": "c", "sourceKey": "t" },
        "environment.humidity.humidity": { "type": "humidity", "sourceUnit": "%", "sourceKey": "rh" }
    }))
    .unwrap();
    let translator = Arc::new(Translator::new(
        "station",
        schema,
        Arc::new(NoProperties),
        UnitSystem::Metric,
    ));
    let observation = Arc::new(RealtimeObservation::new());
    let temperature = key("environment.temperature.temperature");
    let humidity = key("environment.humidity.humidity");

    let writer = {
        let translator = Arc::clone(&translator);
        let observation = Arc::clone(&observation);
        thread::spawn(move || {
            for i in 0..500 {
                // every batch carries t == rh
                let raw = object(json!({ "t": i % 90, "rh": i % 90 }));
                observation.update(&translator, &raw, chrono::Utc::now());
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let observation = Arc::clone(&observation);
            let (temperature, humidity) = (temperature.clone(), humidity.clone());
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let snapshot = observation.snapshot();
                    if let (Some(t), Some(rh)) = (snapshot.get(&temperature), snapshot.get(&humidity)) {
                        assert_eq!(t.as_f64(), rh.as_f64());
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[tokio::test]
async fn test_preferred_source_independent_of_delivery_order() {
    let temperature = key("environment.temperature.temperature");
    let mut winners = Vec::new();

    for reversed in [false, true] {
        let dispatcher = Dispatcher::start();
        let handles = vec![
            station("east", 0, &[]),
            station("west", 1, &["environment"]),
            station("north", 2, &["environment.temperature"]),
        ];
        for handle in &handles {
            dispatcher.connect_source(handle);
            handle.start(&Handle::current());
        }

        let mut order: Vec<_> = handles.iter().enumerate().collect();
        if reversed {
            order.reverse();
        }
        for (i, handle) in order {
            handle.push(&object(json!({ "temp": 10 + i, "time": 1_000 + i })));
        }
        dispatcher.flush().await;

        winners.push(dispatcher.preferred_source(&temperature).unwrap());
        for handle in &handles {
            handle.stop();
        }
    }

    assert_eq!(winners[0], winners[1]);
    assert_eq!(&*winners[0], "north");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sources_never_tear_dispatched_values() {
    const EPOCH: i64 = 1_700_000_000;
    let dispatcher = Dispatcher::start();
    let stations = [station("east", 0, &[]), station("west", 1, &[])];
    for handle in &stations {
        dispatcher.connect_source(handle);
        handle.start(&Handle::current());
    }
    let temperature = key("environment.temperature.temperature");
    let humidity = key("environment.humidity.humidity");

    // east publishes 0..50, west 50..100; within a batch temp, rh and time agree
    let writers: Vec<_> = stations
        .iter()
        .enumerate()
        .map(|(n, handle)| {
            let handle = Arc::clone(handle);
            thread::spawn(move || {
                for i in 0..2_000i64 {
                    let v = n as i64 * 50 + i % 50;
                    handle.push(&object(json!({ "temp": v, "rh": v, "time": EPOCH + v })));
                }
            })
        })
        .collect();

    fn check(resolution: &Resolution) {
        let v = resolution.measurement.as_f64().unwrap() as i64;
        let range = match &*resolution.source {
            "east" => 0..50,
            "west" => 50..100,
            other => panic!("value from unknown source {other}"),
        };
        assert!(range.contains(&v), "{} never published {}", resolution.source, v);
        assert_eq!(resolution.measurement.timestamp.timestamp(), EPOCH + v);
    }

    let readers: Vec<_> = (0..4)
        .map(|n| {
            let dispatcher = dispatcher.clone();
            let (temperature, humidity) = (temperature.clone(), humidity.clone());
            tokio::spawn(async move {
                let source = if n % 2 == 0 { "east" } else { "west" };
                for _ in 0..2_000 {
                    if let Ok(resolution) = dispatcher.get(&temperature) {
                        check(&resolution);
                    }
                    if let Ok(resolution) =
                        dispatcher.get_from(&humidity, SourceSelector::named(source))
                    {
                        assert_eq!(&*resolution.source, source);
                        check(&resolution);
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }

    dispatcher.flush().await;
    let last = dispatcher.get(&temperature).unwrap();
    assert_eq!(&*last.source, "east");
    assert_eq!(last.measurement.as_f64(), Some(49.0));
    let last_west = dispatcher.get_from(&humidity, SourceSelector::named("west")).unwrap();
    assert_eq!(last_west.measurement.as_f64(), Some(99.0));
    for handle in &stations {
        handle.stop();
    }
}
