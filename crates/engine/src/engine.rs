//! Engine internals: the worker registry and submission paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use exengine_core::{EngineError, EngineResult};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::api::{EngineConfig, EngineStatus, WorkerSnapshot};
use crate::bus::NotificationBus;
use crate::proxy::DeviceEntry;
use crate::worker::{run_worker, QueuedItem, WorkerCommand};

/// One named worker: its queue, its thread, and its submission lock.
struct WorkerHandle {
    name: String,
    tx: Sender<WorkerCommand>,
    capacity: Option<usize>,
    /// Serializes enqueues so batches land contiguously.
    submit_lock: Mutex<()>,
    /// Set by `shutdown(false)`: queued items fail instead of running.
    cancel: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn send(&self, item: QueuedItem) -> EngineResult<()> {
        match self.capacity {
            Some(capacity) => match self.tx.try_send(WorkerCommand::Run(item)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(EngineError::QueueFull {
                    worker: self.name.clone(),
                    capacity,
                }),
                Err(TrySendError::Disconnected(_)) => Err(EngineError::ShutDown),
            },
            None => self
                .tx
                .send(WorkerCommand::Run(item))
                .map_err(|_| EngineError::ShutDown),
        }
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    workers: RwLock<HashMap<String, Arc<WorkerHandle>>>,
    devices: RwLock<HashMap<String, Arc<DeviceEntry>>>,
    shut_down: AtomicBool,
    bus: NotificationBus,
    dispatch_join: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    pub(crate) fn new(config: EngineConfig) -> Self {
        let (bus, dispatch_join) = NotificationBus::start(config.notification_queue_depth);
        debug!(default_worker = %config.default_worker, "engine started");
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            bus,
            dispatch_join: Mutex::new(dispatch_join),
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Enqueue one item on the named worker, creating the worker on first
    /// use.
    pub(crate) fn enqueue(&self, worker: &str, item: QueuedItem) -> EngineResult<()> {
        let handle = self.worker(worker)?;
        let _guard = handle.submit_lock.lock();
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        handle.send(item)
    }

    /// Enqueue several items contiguously, in order, on one worker.
    pub(crate) fn enqueue_batch(&self, worker: &str, items: Vec<QueuedItem>) -> EngineResult<()> {
        let handle = self.worker(worker)?;
        let _guard = handle.submit_lock.lock();
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        for item in items {
            handle.send(item)?;
        }
        Ok(())
    }

    /// Look up or lazily create the named worker.
    fn worker(&self, name: &str) -> EngineResult<Arc<WorkerHandle>> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        if let Some(handle) = self.workers.read().get(name) {
            return Ok(handle.clone());
        }

        let mut workers = self.workers.write();
        if self.is_shut_down() {
            // A concurrent shutdown already drained the registry.
            return Err(EngineError::ShutDown);
        }
        if let Some(handle) = workers.get(name) {
            return Ok(handle.clone());
        }

        let (tx, rx) = match self.config.max_queue_depth {
            Some(depth) => bounded(depth),
            None => unbounded(),
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));

        let thread_name = format!("exengine-worker-{name}");
        let worker_name = name.to_string();
        let worker_cancel = cancel.clone();
        let worker_busy = busy.clone();
        let worker_bus = self.bus.clone();
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_worker(worker_name, rx, worker_cancel, worker_busy, worker_bus))
            .map_err(|source| EngineError::WorkerSpawn {
                worker: name.to_string(),
                source,
            })?;

        let handle = Arc::new(WorkerHandle {
            name: name.to_string(),
            tx,
            capacity: self.config.max_queue_depth,
            submit_lock: Mutex::new(()),
            cancel,
            busy,
            join: Mutex::new(Some(join)),
        });
        workers.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Pre-create a worker so registration failures surface early.
    pub(crate) fn ensure_worker(&self, name: &str) -> EngineResult<()> {
        self.worker(name).map(|_| ())
    }

    pub(crate) fn insert_device(&self, entry: Arc<DeviceEntry>) -> EngineResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(entry.name()) {
            return Err(EngineError::DuplicateDevice {
                name: entry.name().to_string(),
            });
        }
        devices.insert(entry.name().to_string(), entry);
        Ok(())
    }

    pub(crate) fn device_entry(&self, name: &str) -> Option<Arc<DeviceEntry>> {
        self.devices.read().get(name).cloned()
    }

    pub(crate) fn status(&self) -> EngineStatus {
        let workers = self
            .workers
            .read()
            .values()
            .map(|w| WorkerSnapshot {
                name: w.name.clone(),
                queued: w.tx.len(),
                busy: w.busy.load(Ordering::SeqCst),
            })
            .collect();
        EngineStatus {
            shut_down: self.is_shut_down(),
            workers,
        }
    }

    /// Stop accepting submissions and tear the workers down. With `wait`,
    /// queued items run to completion first; without it they fail.
    pub(crate) fn shutdown(&self, wait: bool) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers: Vec<Arc<WorkerHandle>> = {
            let mut map = self.workers.write();
            map.drain().map(|(_, handle)| handle).collect()
        };
        if !wait {
            for handle in &workers {
                handle.cancel.store(true, Ordering::SeqCst);
            }
        }
        for handle in &workers {
            // Under the submit lock: in-flight submissions either precede
            // the stop marker or observe the shutdown flag and reject.
            let _guard = handle.submit_lock.lock();
            let _ = handle.tx.send(WorkerCommand::Stop);
        }
        for handle in &workers {
            if let Some(join) = handle.join.lock().take() {
                let _ = join.join();
            }
        }

        self.bus.stop();
        if let Some(join) = self.dispatch_join.lock().take() {
            let _ = join.join();
        }
        debug!(drained = wait, "engine shut down");
    }
}
