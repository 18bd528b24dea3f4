//! Data handler behavior: in-flight visibility, processing, eviction,
//! unknown-coordinate proofs, and failure surfacing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use exengine::{
    kinds, AxisSpace, Capabilities, CoordinateList, DataCoordinates, DataHandler, DataItem,
    Engine, EngineConfig, EngineError, Event, EventContext, EvictionPolicy, HandlerOptions,
    Metadata, NotificationFilter, Storage,
};
use parking_lot::Mutex;

fn engine() -> Engine {
    Engine::start(EngineConfig::default())
}

fn t(value: i64) -> DataCoordinates {
    DataCoordinates::from_pairs([("t", value)])
}

/// Minimal thread-safe backend for tests.
#[derive(Default)]
struct MemoryStore {
    items: Mutex<HashMap<DataCoordinates, (Vec<u8>, Metadata)>>,
    puts: AtomicUsize,
    finished: AtomicBool,
    closed: AtomicBool,
}

impl Storage for MemoryStore {
    fn put(&self, coords: &DataCoordinates, payload: &[u8], metadata: &Metadata) -> anyhow::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.items
            .lock()
            .insert(coords.clone(), (payload.to_vec(), metadata.clone()));
        Ok(())
    }

    fn get_data(&self, coords: &DataCoordinates) -> anyhow::Result<Vec<u8>> {
        self.items
            .lock()
            .get(coords)
            .map(|(payload, _)| payload.clone())
            .ok_or_else(|| anyhow::anyhow!("no data at {coords}"))
    }

    fn get_metadata(&self, coords: &DataCoordinates) -> anyhow::Result<Metadata> {
        self.items
            .lock()
            .get(coords)
            .map(|(_, metadata)| metadata.clone())
            .ok_or_else(|| anyhow::anyhow!("no metadata at {coords}"))
    }

    fn contains(&self, coords: &DataCoordinates) -> anyhow::Result<bool> {
        Ok(self.items.lock().contains_key(coords))
    }

    fn finish(&self) -> anyhow::Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Puts frames `t = 0..count`, then holds until released so tests can
/// observe data before the event completes.
struct AcquireSeries {
    handler: DataHandler,
    count: i64,
    release: Receiver<()>,
}

impl Event for AcquireSeries {
    type Output = i64;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.data_producing()
    }

    fn data_handler(&self) -> Option<DataHandler> {
        Some(self.handler.clone())
    }

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<i64> {
        for i in 0..self.count {
            self.handler.put(t(i), vec![i as u8], Metadata::new())?;
        }
        let _ = self.release.recv();
        Ok(self.count)
    }
}

#[test]
fn test_data_round_trip() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let handler = engine.data_handler(store.clone()).unwrap();
    let (release_tx, release_rx): (Sender<()>, Receiver<()>) = bounded(1);

    let future = engine
        .submit(AcquireSeries {
            handler: handler.clone(),
            count: 10,
            release: release_rx,
        })
        .unwrap();

    // Mid-flight visibility: the item is served while the event still runs.
    let item = future
        .await_data_for(&t(5), Duration::from_secs(5))
        .unwrap();
    assert_eq!(item.payload, vec![5u8]);
    assert_eq!(item.metadata, Metadata::new());
    assert!(!future.is_execution_complete());

    release_tx.send(()).unwrap();
    assert_eq!(future.await_execution().unwrap(), 10);

    handler.finish().unwrap();
    assert!(store.finished.load(Ordering::SeqCst));
    assert!(store.closed.load(Ordering::SeqCst));
    assert_eq!(store.get_data(&t(9)).unwrap(), vec![9u8]);
    engine.shutdown(true);
}

#[test]
fn test_await_data_many_preserves_order() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let handler = engine.data_handler(store).unwrap();
    let (release_tx, release_rx) = bounded(1);

    let future = engine
        .submit(AcquireSeries {
            handler: handler.clone(),
            count: 4,
            release: release_rx,
        })
        .unwrap();

    let wanted = [t(3), t(0), t(2)];
    let items = future.await_data_many(&wanted).unwrap();
    let payloads: Vec<_> = items.into_iter().map(|i: DataItem| i.payload).collect();
    assert_eq!(payloads, vec![vec![3u8], vec![0u8], vec![2u8]]);

    release_tx.send(()).unwrap();
    future.await_execution().unwrap();
    handler.finish().unwrap();
    engine.shutdown(true);
}

#[test]
fn test_processor_expansion() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let processor = |coords: &DataCoordinates,
                     payload: &[u8],
                     _metadata: &Metadata|
     -> anyhow::Result<Vec<DataItem>> {
        let split = ["A", "B"].iter().map(|channel| {
            let mut out = coords.clone();
            out.insert("channel", *channel);
            let mut metadata = Metadata::new();
            metadata.insert("channel".into(), serde_json::Value::String((*channel).into()));
            DataItem::new(out, payload.to_vec(), metadata)
        });
        Ok(split.collect())
    };
    let handler = engine
        .data_handler_with(
            store.clone(),
            HandlerOptions {
                processor: Some(Box::new(processor)),
                ..HandlerOptions::default()
            },
        )
        .unwrap();

    handler.put(t(0), b"x".to_vec(), Metadata::new()).unwrap();

    let mut a = t(0);
    a.insert("channel", "A");
    let mut b = t(0);
    b.insert("channel", "B");

    // Processor outputs are visible to get before and after persistence.
    let item_a = handler.get_for(&a, Duration::from_secs(5)).unwrap();
    assert_eq!(item_a.payload, b"x".to_vec());
    assert_eq!(item_a.metadata["channel"], "A");

    handler.finish().unwrap();
    assert_eq!(store.get_data(&a).unwrap(), b"x".to_vec());
    assert_eq!(store.get_data(&b).unwrap(), b"x".to_vec());
    assert_eq!(store.get_metadata(&b).unwrap()["channel"], "B");
    engine.shutdown(true);
}

/// Accumulates inputs and emits a summary item only at finish.
struct DeferringProcessor {
    seen: usize,
}

impl exengine::DataProcessor for DeferringProcessor {
    fn process(
        &mut self,
        _coords: &DataCoordinates,
        _payload: &[u8],
        _metadata: &Metadata,
    ) -> anyhow::Result<Vec<DataItem>> {
        self.seen += 1;
        Ok(Vec::new())
    }

    fn finish(&mut self) -> anyhow::Result<Vec<DataItem>> {
        let coords = DataCoordinates::from_pairs([("summary", 0i64)]);
        Ok(vec![DataItem::new(
            coords,
            vec![self.seen as u8],
            Metadata::new(),
        )])
    }
}

#[test]
fn test_processor_may_defer_until_finish() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let handler = engine
        .data_handler_with(
            store.clone(),
            HandlerOptions {
                processor: Some(Box::new(DeferringProcessor { seen: 0 })),
                ..HandlerOptions::default()
            },
        )
        .unwrap();

    for i in 0..3 {
        handler.put(t(i), vec![0], Metadata::new()).unwrap();
    }
    handler.finish().unwrap();

    let summary = DataCoordinates::from_pairs([("summary", 0i64)]);
    assert_eq!(store.get_data(&summary).unwrap(), vec![3u8]);
    // Dropped inputs never reached storage but stay readable in memory.
    assert!(!store.contains(&t(0)).unwrap());
    assert_eq!(handler.get(&t(0)).unwrap().payload, vec![0u8]);
    engine.shutdown(true);
}

#[test]
fn test_unknown_coordinates_proof_from_sequence() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let space = AxisSpace::new().axis_range("t", 0, 10);
    let handler = engine
        .data_handler_with(
            store,
            HandlerOptions {
                sequence: Some(Box::new(space)),
                ..HandlerOptions::default()
            },
        )
        .unwrap();

    // Provably outside the acquisition space: immediate error, no blocking.
    let err = handler.get(&t(99)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownCoordinates(_)));

    handler.put(t(1), vec![1], Metadata::new()).unwrap();
    assert_eq!(handler.get(&t(1)).unwrap().payload, vec![1u8]);
    handler.finish().unwrap();
    engine.shutdown(true);
}

#[test]
fn test_absent_coordinates_fail_after_finish() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let handler = engine.data_handler(store).unwrap();

    handler.put(t(0), vec![0], Metadata::new()).unwrap();
    handler.finish().unwrap();

    let err = handler.get(&t(1)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownCoordinates(_)));
    assert!(matches!(
        handler.put(t(2), vec![2], Metadata::new()),
        Err(EngineError::HandlerFinished)
    ));
    engine.shutdown(true);
}

#[test]
fn test_finite_list_still_blocks_for_pending_coords() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let expected = CoordinateList::new(vec![t(0), t(1)]);
    let handler = engine
        .data_handler_with(
            store,
            HandlerOptions {
                sequence: Some(Box::new(expected)),
                ..HandlerOptions::default()
            },
        )
        .unwrap();

    // In the sequence but not yet produced: blocks until timeout.
    assert!(matches!(
        handler.get_for(&t(1), Duration::from_millis(30)),
        Err(EngineError::Timeout)
    ));
    handler.finish().unwrap();
    engine.shutdown(true);
}

#[test]
fn test_eviction_falls_back_to_storage() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    // Default policy drops payloads once persisted.
    let handler = engine.data_handler(store.clone()).unwrap();

    handler.put(t(0), vec![7; 64], Metadata::new()).unwrap();
    handler.finish().unwrap();

    let item = handler.get(&t(0)).unwrap();
    assert_eq!(item.payload, vec![7; 64]);
    // Served from the backend, not the table.
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    engine.shutdown(true);
}

#[test]
fn test_retain_policy_respects_memory_bound() {
    let engine = engine();
    let store = Arc::new(MemoryStore::default());
    let handler = engine
        .data_handler_with(
            store.clone(),
            HandlerOptions {
                eviction: EvictionPolicy::Retain,
                memory_bound: Some(128),
                ..HandlerOptions::default()
            },
        )
        .unwrap();

    for i in 0..4 {
        handler.put(t(i), vec![i as u8; 64], Metadata::new()).unwrap();
    }
    handler.finish().unwrap();

    // Everything is still retrievable, resident or not.
    for i in 0..4 {
        assert_eq!(handler.get(&t(i)).unwrap().payload, vec![i as u8; 64]);
    }
    engine.shutdown(true);
}

struct FailingStore;

impl Storage for FailingStore {
    fn put(&self, _: &DataCoordinates, _: &[u8], _: &Metadata) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("disk full"))
    }

    fn get_data(&self, coords: &DataCoordinates) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("no data at {coords}"))
    }

    fn get_metadata(&self, coords: &DataCoordinates) -> anyhow::Result<Metadata> {
        Err(anyhow::anyhow!("no metadata at {coords}"))
    }

    fn contains(&self, _: &DataCoordinates) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_storage_failure_is_surfaced_and_broadcast() {
    let engine = engine();
    let failures = Arc::new(AtomicUsize::new(0));
    let sink = failures.clone();
    let _subscription = engine.subscribe_filtered(
        NotificationFilter::Kind(kinds::STORAGE_FAILED.to_string()),
        move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        },
    );

    let handler = engine.data_handler(Arc::new(FailingStore)).unwrap();
    handler.put(t(0), vec![0], Metadata::new()).unwrap();

    // The failure lands on the next pipeline interaction.
    let err = handler.finish().unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    assert!(err.to_string().contains("disk full"));
    assert!(matches!(
        handler.put(t(1), vec![1], Metadata::new()),
        Err(EngineError::Storage(_))
    ));

    engine.shutdown(true);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_data_stored_notifications() {
    let engine = engine();
    let stored = Arc::new(Mutex::new(Vec::new()));
    let sink = stored.clone();
    let _subscription = engine.subscribe_filtered(
        NotificationFilter::Kind(kinds::DATA_STORED.to_string()),
        move |n| {
            sink.lock().push(n.payload.clone());
        },
    );

    let store = Arc::new(MemoryStore::default());
    let handler = engine.data_handler(store).unwrap();
    handler.put(t(0), vec![0], Metadata::new()).unwrap();
    handler.put(t(1), vec![1], Metadata::new()).unwrap();
    handler.finish().unwrap();
    engine.shutdown(true);

    let stored = stored.lock();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0], Some(serde_json::json!({"t": 0})));
    assert_eq!(stored[1], Some(serde_json::json!({"t": 1})));
}
