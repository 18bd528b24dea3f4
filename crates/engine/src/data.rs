//! The data handler: an in-memory stage between data-producing events and
//! a storage backend.
//!
//! Puts are non-blocking and immediately visible to `get`/`await_data`.
//! Persistence runs on a single writer thread so backends never see
//! concurrent writes; an optional processor thread can transform items on
//! the way to storage. Pipeline failures are recorded and surfaced by the
//! next `put`, `get`, or `finish`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use exengine_core::{
    CoordinateSequence, DataCoordinates, DataItem, EngineError, EngineResult, Metadata,
    Notification, Storage,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::bus::NotificationBus;

/// A user-supplied stage transforming items before persistence.
///
/// Each input may expand to any number of outputs; an empty vec drops the
/// input or defers it for a later emission from [`DataProcessor::finish`].
pub trait DataProcessor: Send + 'static {
    /// Transform one item.
    fn process(
        &mut self,
        coords: &DataCoordinates,
        payload: &[u8],
        metadata: &Metadata,
    ) -> anyhow::Result<Vec<DataItem>>;

    /// Emit any deferred items; called once when production finishes.
    fn finish(&mut self) -> anyhow::Result<Vec<DataItem>> {
        Ok(Vec::new())
    }
}

impl<F> DataProcessor for F
where
    F: FnMut(&DataCoordinates, &[u8], &Metadata) -> anyhow::Result<Vec<DataItem>> + Send + 'static,
{
    fn process(
        &mut self,
        coords: &DataCoordinates,
        payload: &[u8],
        metadata: &Metadata,
    ) -> anyhow::Result<Vec<DataItem>> {
        self(coords, payload, metadata)
    }
}

/// What happens to an in-memory payload once storage confirms persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop the payload as soon as it is persisted; `get` falls back to
    /// the storage backend.
    #[default]
    DropAfterStore,
    /// Keep payloads resident until the handler's memory bound is
    /// exceeded, then evict oldest-stored first.
    Retain,
}

/// Construction options for a data handler.
#[derive(Default)]
pub struct HandlerOptions {
    /// Optional processing stage between puts and storage.
    pub processor: Option<Box<dyn DataProcessor>>,
    /// The coordinates the producer may emit, used to prove requests
    /// unsatisfiable.
    pub sequence: Option<Box<dyn CoordinateSequence>>,
    /// Resident payload budget in bytes for [`EvictionPolicy::Retain`].
    pub memory_bound: Option<usize>,
    /// Post-persistence payload policy.
    pub eviction: EvictionPolicy,
}

enum Slot {
    /// Put or emitted by the processor, not yet confirmed persisted.
    Pending {
        payload: Arc<Vec<u8>>,
        metadata: Metadata,
    },
    /// Persisted; payload present only while resident.
    Stored {
        payload: Option<Arc<Vec<u8>>>,
        metadata: Metadata,
    },
}

#[derive(Default)]
struct Table {
    slots: HashMap<DataCoordinates, Slot>,
    /// `finish()` was called; no further puts.
    finished: bool,
    /// The pipeline has flushed; absent coordinates are now unknowable.
    drained: bool,
    failure: Option<Arc<anyhow::Error>>,
    resident_bytes: usize,
    stored_order: VecDeque<DataCoordinates>,
}

struct PipelineItem {
    coords: DataCoordinates,
    payload: Arc<Vec<u8>>,
    metadata: Metadata,
}

enum PipeMsg {
    Item(PipelineItem),
    Finish,
}

struct HandlerShared {
    table: Mutex<Table>,
    cond: Condvar,
    storage: Arc<dyn Storage>,
    bus: NotificationBus,
    sequence: Option<Box<dyn CoordinateSequence>>,
    intake: Mutex<Option<Sender<PipeMsg>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HandlerShared {
    fn record_failure(&self, error: Arc<anyhow::Error>) {
        let mut table = self.table.lock();
        if table.failure.is_none() {
            table.failure = Some(error);
        }
        drop(table);
        self.cond.notify_all();
    }
}

/// Thread-safe handle to one data pipeline. Cheap to clone.
#[derive(Clone)]
pub struct DataHandler {
    shared: Arc<HandlerShared>,
}

impl DataHandler {
    pub(crate) fn start(
        storage: Arc<dyn Storage>,
        options: HandlerOptions,
        bus: NotificationBus,
    ) -> EngineResult<Self> {
        let shared = Arc::new(HandlerShared {
            table: Mutex::new(Table::default()),
            cond: Condvar::new(),
            storage,
            bus,
            sequence: options.sequence,
            intake: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        let (store_tx, store_rx) = unbounded();
        let mut threads = Vec::new();

        let writer_shared = shared.clone();
        let eviction = options.eviction;
        let memory_bound = options.memory_bound;
        threads.push(spawn_pipeline_thread("exengine-data-store", move || {
            run_storage_writer(&writer_shared, &store_rx, eviction, memory_bound);
        })?);

        let intake = match options.processor {
            Some(processor) => {
                let (proc_tx, proc_rx) = unbounded();
                let proc_shared = shared.clone();
                threads.push(spawn_pipeline_thread("exengine-data-proc", move || {
                    run_processor(&proc_shared, &proc_rx, &store_tx, processor);
                })?);
                proc_tx
            }
            None => store_tx,
        };

        *shared.intake.lock() = Some(intake);
        *shared.threads.lock() = threads;
        Ok(Self { shared })
    }

    /// Record one item. Non-blocking; the item is immediately observable
    /// via `get` while persistence proceeds in the background.
    pub fn put(
        &self,
        coords: DataCoordinates,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> EngineResult<()> {
        let payload = Arc::new(payload);
        // Hold the intake sender across the finished check so a racing
        // `finish` cannot slip its flush marker in front of this item.
        let intake = self.shared.intake.lock();
        {
            let mut table = self.shared.table.lock();
            if let Some(failure) = &table.failure {
                return Err(EngineError::Storage(failure.clone()));
            }
            if table.finished {
                return Err(EngineError::HandlerFinished);
            }
            insert_pending(&mut table, coords.clone(), payload.clone(), metadata.clone());
        }
        self.shared.cond.notify_all();

        if let Some(tx) = intake.as_ref() {
            let _ = tx.send(PipeMsg::Item(PipelineItem {
                coords,
                payload,
                metadata,
            }));
        }
        Ok(())
    }

    /// Block until `coords` is available in memory or persisted, then
    /// return the item (payload fetched back from storage if evicted).
    pub fn get(&self, coords: &DataCoordinates) -> EngineResult<DataItem> {
        self.get_inner(coords, None)
    }

    /// [`Self::get`] with a timeout.
    pub fn get_for(&self, coords: &DataCoordinates, timeout: Duration) -> EngineResult<DataItem> {
        self.get_inner(coords, Some(timeout))
    }

    fn get_inner(&self, coords: &DataCoordinates, timeout: Option<Duration>) -> EngineResult<DataItem> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.shared.table.lock();
        loop {
            match table.slots.get(coords) {
                Some(Slot::Pending { payload, metadata })
                | Some(Slot::Stored {
                    payload: Some(payload),
                    metadata,
                }) => {
                    return Ok(DataItem::new(
                        coords.clone(),
                        payload.as_ref().clone(),
                        metadata.clone(),
                    ));
                }
                Some(Slot::Stored {
                    payload: None,
                    metadata,
                }) => {
                    // Evicted; read back from the backend without holding
                    // the table lock.
                    let metadata = metadata.clone();
                    drop(table);
                    let payload = self
                        .shared
                        .storage
                        .get_data(coords)
                        .map_err(|e| EngineError::Storage(Arc::new(e)))?;
                    return Ok(DataItem::new(coords.clone(), payload, metadata));
                }
                None => {}
            }

            if let Some(failure) = &table.failure {
                return Err(EngineError::Storage(failure.clone()));
            }
            if let Some(sequence) = &self.shared.sequence {
                if !sequence.may_produce(coords) {
                    return Err(EngineError::UnknownCoordinates(coords.clone()));
                }
            }
            if table.drained {
                return Err(EngineError::UnknownCoordinates(coords.clone()));
            }

            match deadline {
                None => self.shared.cond.wait(&mut table),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut table, deadline).timed_out()
                        && !table.slots.contains_key(coords)
                    {
                        return Err(EngineError::Timeout);
                    }
                }
            }
        }
    }

    /// Block until the metadata for `coords` is available.
    pub fn get_metadata(&self, coords: &DataCoordinates) -> EngineResult<Metadata> {
        self.get(coords).map(|item| item.metadata)
    }

    /// Whether `coords` has been put (or emitted by the processor).
    pub fn contains(&self, coords: &DataCoordinates) -> bool {
        self.shared.table.lock().slots.contains_key(coords)
    }

    /// Signal end of production: flush the processor and the storage
    /// writer, close the backend, and surface any deferred failure.
    /// Subsequent puts are rejected. Idempotent.
    pub fn finish(&self) -> EngineResult<()> {
        self.shared.table.lock().finished = true;

        let intake = self.shared.intake.lock().take();
        if let Some(tx) = intake {
            let _ = tx.send(PipeMsg::Finish);
        }

        let threads: Vec<JoinHandle<()>> = self.shared.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        self.shared.cond.notify_all();

        match &self.shared.table.lock().failure {
            Some(failure) => Err(EngineError::Storage(failure.clone())),
            None => Ok(()),
        }
    }
}

fn spawn_pipeline_thread(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> EngineResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| EngineError::WorkerSpawn {
            worker: name.to_string(),
            source,
        })
}

fn insert_pending(
    table: &mut Table,
    coords: DataCoordinates,
    payload: Arc<Vec<u8>>,
    metadata: Metadata,
) {
    table.resident_bytes += payload.len();
    if let Some(previous) = table.slots.insert(coords, Slot::Pending { payload, metadata }) {
        table.resident_bytes -= resident_len(&previous);
    }
}

fn resident_len(slot: &Slot) -> usize {
    match slot {
        Slot::Pending { payload, .. } => payload.len(),
        Slot::Stored {
            payload: Some(payload),
            ..
        } => payload.len(),
        Slot::Stored { payload: None, .. } => 0,
    }
}

fn run_storage_writer(
    shared: &HandlerShared,
    rx: &Receiver<PipeMsg>,
    eviction: EvictionPolicy,
    memory_bound: Option<usize>,
) {
    debug!("storage writer started");
    for msg in rx.iter() {
        match msg {
            PipeMsg::Item(item) => {
                match shared
                    .storage
                    .put(&item.coords, &item.payload, &item.metadata)
                {
                    Ok(()) => {
                        mark_stored(shared, &item, eviction, memory_bound);
                        shared.bus.publish(Notification::data_stored(&item.coords));
                    }
                    Err(err) => {
                        let err = Arc::new(err);
                        error!(coords = %item.coords, error = %err, "storage put failed");
                        shared
                            .bus
                            .publish(Notification::storage_failed(&item.coords, &err));
                        shared.record_failure(err);
                    }
                }
            }
            PipeMsg::Finish => {
                let result = shared.storage.finish().and_then(|()| shared.storage.close());
                if let Err(err) = result {
                    let err = Arc::new(err);
                    error!(error = %err, "storage finish failed");
                    shared.record_failure(err);
                }
                let mut table = shared.table.lock();
                table.drained = true;
                drop(table);
                shared.cond.notify_all();
                break;
            }
        }
    }
    debug!("storage writer stopped");
}

fn mark_stored(
    shared: &HandlerShared,
    item: &PipelineItem,
    eviction: EvictionPolicy,
    memory_bound: Option<usize>,
) {
    let mut table = shared.table.lock();
    let keep = eviction == EvictionPolicy::Retain;
    let previous = table.slots.insert(
        item.coords.clone(),
        Slot::Stored {
            payload: keep.then(|| item.payload.clone()),
            metadata: item.metadata.clone(),
        },
    );
    if let Some(previous) = previous {
        table.resident_bytes -= resident_len(&previous);
    }
    if keep {
        table.resident_bytes += item.payload.len();
        table.stored_order.push_back(item.coords.clone());
        enforce_memory_bound(&mut table, memory_bound);
    }
    drop(table);
    shared.cond.notify_all();
}

/// Evict oldest-stored payloads until the resident set fits the bound.
fn enforce_memory_bound(table: &mut Table, memory_bound: Option<usize>) {
    let Some(bound) = memory_bound else { return };
    while table.resident_bytes > bound {
        let Some(coords) = table.stored_order.pop_front() else {
            break;
        };
        let mut freed = 0;
        if let Some(Slot::Stored { payload, .. }) = table.slots.get_mut(&coords) {
            if let Some(resident) = payload.take() {
                freed = resident.len();
            }
        }
        table.resident_bytes -= freed;
    }
}

fn run_processor(
    shared: &HandlerShared,
    rx: &Receiver<PipeMsg>,
    store_tx: &Sender<PipeMsg>,
    mut processor: Box<dyn DataProcessor>,
) {
    debug!("processor started");
    for msg in rx.iter() {
        match msg {
            PipeMsg::Item(item) => {
                match processor.process(&item.coords, &item.payload, &item.metadata) {
                    Ok(outputs) => forward_outputs(shared, store_tx, outputs),
                    Err(err) => {
                        let err = Arc::new(err);
                        error!(coords = %item.coords, error = %err, "processor failed");
                        shared.record_failure(err);
                    }
                }
            }
            PipeMsg::Finish => {
                match processor.finish() {
                    Ok(outputs) => forward_outputs(shared, store_tx, outputs),
                    Err(err) => {
                        let err = Arc::new(err);
                        error!(error = %err, "processor finish failed");
                        shared.record_failure(err);
                    }
                }
                let _ = store_tx.send(PipeMsg::Finish);
                break;
            }
        }
    }
    debug!("processor stopped");
}

/// Insert processor outputs into the table (visible to `get`) and forward
/// them to the storage writer.
fn forward_outputs(shared: &HandlerShared, store_tx: &Sender<PipeMsg>, outputs: Vec<DataItem>) {
    for output in outputs {
        let payload = Arc::new(output.payload);
        {
            let mut table = shared.table.lock();
            insert_pending(
                &mut table,
                output.coords.clone(),
                payload.clone(),
                output.metadata.clone(),
            );
        }
        shared.cond.notify_all();
        let _ = store_tx.send(PipeMsg::Item(PipelineItem {
            coords: output.coords,
            payload,
            metadata: output.metadata,
        }));
    }
}
