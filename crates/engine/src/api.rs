//! Public API types for the in-process execution engine.

use std::sync::Arc;

use exengine_core::{Device, EngineError, EngineResult, Notification, NotificationFilter, Storage};
use serde::Serialize;

use crate::bus::Subscription;
use crate::data::{DataHandler, HandlerOptions};
use crate::engine::EngineInner;
use crate::event::{Callable, Event};
use crate::future::{new_future, EventFuture};
use crate::proxy::{self, DeviceOptions, DeviceProxy};
use crate::worker::QueuedItem;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker receiving submissions that name no other worker.
    pub default_worker: String,

    /// Per-worker queue capacity; `None` means unbounded. A full queue
    /// rejects submissions instead of blocking.
    pub max_queue_depth: Option<usize>,

    /// Capacity of the notification dispatch queue. Publication never
    /// blocks; when the queue is full the notification is dropped.
    pub notification_queue_depth: usize,

    /// Default resident-payload budget for data handlers using
    /// [`crate::EvictionPolicy::Retain`]; `None` means unbounded.
    pub handler_memory_bound: Option<usize>,
}

impl EngineConfig {
    /// Default worker name.
    pub const DEFAULT_WORKER: &str = "main";

    /// Default notification dispatch queue depth.
    pub const DEFAULT_NOTIFICATION_QUEUE_DEPTH: usize = 1024;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_worker: Self::DEFAULT_WORKER.to_string(),
            max_queue_depth: None,
            notification_queue_depth: Self::DEFAULT_NOTIFICATION_QUEUE_DEPTH,
            handler_memory_bound: None,
        }
    }
}

/// Snapshot of a single worker's state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker name.
    pub name: String,
    /// Items waiting on the queue.
    pub queued: usize,
    /// Whether an item is currently executing.
    pub busy: bool,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Whether the engine has been shut down.
    pub shut_down: bool,
    /// Per-worker snapshots, in no particular order.
    pub workers: Vec<WorkerSnapshot>,
}

/// Handle to a running engine instance. Cheap to clone; all clones drive
/// the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start a new engine instance.
    pub fn start(config: EngineConfig) -> Engine {
        Engine {
            inner: Arc::new(EngineInner::new(config)),
        }
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    /// Submit a structured event. The worker is the event's preference
    /// when it has one, else the engine default.
    pub fn submit<E: Event>(&self, event: E) -> EngineResult<EventFuture<E::Output>> {
        self.submit_impl(None, event, true)
    }

    /// Submit a structured event on the named worker, created lazily on
    /// first use.
    pub fn submit_on<E: Event>(&self, worker: &str, event: E) -> EngineResult<EventFuture<E::Output>> {
        self.submit_impl(Some(worker), event, true)
    }

    /// Submit a plain callable on the default worker. Callables carry no
    /// capabilities and publish no notifications.
    pub fn submit_fn<F, R>(&self, f: F) -> EngineResult<EventFuture<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        self.submit_impl(None, Callable::new(f), false)
    }

    /// Submit a plain callable on the named worker.
    pub fn submit_fn_on<F, R>(&self, worker: &str, f: F) -> EngineResult<EventFuture<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        self.submit_impl(Some(worker), Callable::new(f), false)
    }

    /// Submit several events so they occupy the worker's queue
    /// contiguously, in order, ahead of any concurrent submission.
    ///
    /// All items land on one worker: the first event's preference, or the
    /// engine default. Use [`Self::submit_batch_on`] to name it.
    pub fn submit_batch<E: Event>(&self, events: Vec<E>) -> EngineResult<Vec<EventFuture<E::Output>>> {
        self.batch_impl(None, events)
    }

    /// [`Self::submit_batch`] on the named worker.
    pub fn submit_batch_on<E: Event>(
        &self,
        worker: &str,
        events: Vec<E>,
    ) -> EngineResult<Vec<EventFuture<E::Output>>> {
        self.batch_impl(Some(worker), events)
    }

    fn submit_impl<E: Event>(
        &self,
        worker: Option<&str>,
        event: E,
        emit_terminal: bool,
    ) -> EngineResult<EventFuture<E::Output>> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let (name, item, future) = self.prepare(worker, event, emit_terminal);
        self.inner.enqueue(&name, item)?;
        Ok(future)
    }

    fn batch_impl<E: Event>(
        &self,
        worker: Option<&str>,
        events: Vec<E>,
    ) -> EngineResult<Vec<EventFuture<E::Output>>> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let name = worker
            .map(str::to_string)
            .or_else(|| {
                events
                    .first()
                    .and_then(|e| e.preferred_worker().map(str::to_string))
            })
            .unwrap_or_else(|| self.inner.config().default_worker.clone());

        let mut items = Vec::with_capacity(events.len());
        let mut futures = Vec::with_capacity(events.len());
        for event in events {
            let (_, item, future) = self.prepare(Some(&name), event, true);
            items.push(item);
            futures.push(future);
        }
        self.inner.enqueue_batch(&name, items)?;
        Ok(futures)
    }

    /// Resolve the worker and package one event for the queue.
    fn prepare<E: Event>(
        &self,
        worker: Option<&str>,
        event: E,
        emit_terminal: bool,
    ) -> (String, QueuedItem, EventFuture<E::Output>) {
        let capabilities = event.capabilities();
        let handler = if capabilities.data_producing {
            event.data_handler()
        } else {
            None
        };
        let declared = event.notification_kinds().to_vec().into_boxed_slice();
        let name = worker
            .map(str::to_string)
            .or_else(|| event.preferred_worker().map(str::to_string))
            .unwrap_or_else(|| self.inner.config().default_worker.clone());

        let (future, shared, control) = new_future(capabilities, handler);
        let item = QueuedItem {
            event: Box::new(event),
            shared,
            control,
            emit_terminal,
            declared,
        };
        (name, item, future)
    }

    /// Subscribe to every notification.
    pub fn subscribe(
        &self,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_filtered(NotificationFilter::All, handler)
    }

    /// Subscribe with a kind or category filter.
    pub fn subscribe_filtered(
        &self,
        filter: NotificationFilter,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus().subscribe(filter, Box::new(handler))
    }

    /// Remove a subscription. Safe to call twice.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.bus().unsubscribe(subscription);
    }

    /// Register a device and return its proxy. The engine takes ownership
    /// of the device; all further access goes through the proxy.
    pub fn register_device(
        &self,
        name: &str,
        device: impl Device,
        options: DeviceOptions,
    ) -> EngineResult<DeviceProxy> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        proxy::register(self, name, Arc::new(device), options)
    }

    /// Proxy for a previously registered device.
    pub fn device(&self, name: &str) -> Option<DeviceProxy> {
        self.inner
            .device_entry(name)
            .map(|entry| proxy::proxy_for(self, entry))
    }

    /// Create a data handler writing to `storage`, with the engine's
    /// default memory bound.
    pub fn data_handler(&self, storage: Arc<dyn Storage>) -> EngineResult<DataHandler> {
        let options = HandlerOptions {
            memory_bound: self.inner.config().handler_memory_bound,
            ..HandlerOptions::default()
        };
        self.data_handler_with(storage, options)
    }

    /// Create a data handler with explicit options.
    pub fn data_handler_with(
        &self,
        storage: Arc<dyn Storage>,
        options: HandlerOptions,
    ) -> EngineResult<DataHandler> {
        DataHandler::start(storage, options, self.inner.bus().clone())
    }

    /// The worker receiving unnamed submissions.
    pub fn default_worker(&self) -> &str {
        &self.inner.config().default_worker
    }

    /// Per-worker queue depths and busy flags.
    pub fn status(&self) -> EngineStatus {
        self.inner.status()
    }

    /// Stop accepting submissions and tear down the workers. With `wait`,
    /// queued items run to completion; without it, queued-but-not-running
    /// items fail. Running items finish per their own stop semantics.
    /// Idempotent.
    pub fn shutdown(&self, wait: bool) {
        self.inner.shutdown(wait);
    }
}
