//! Futures: the return channel from the executor back to user code.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use exengine_core::{DataCoordinates, DataItem, EngineError, EngineResult, Metadata, Notification};
use parking_lot::{Condvar, Mutex};

use crate::data::DataHandler;
use crate::event::Capabilities;

/// Lifecycle of a submitted work item.
///
/// Transitions are monotonic: `Pending → Running → ` one of the terminal
/// states. Stop and abort requests may race with completion but never
/// un-complete a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Queued, not yet picked up by the worker.
    Pending,
    /// `execute()` is running.
    Running,
    /// Completed; the recorded outcome is the returned value.
    Succeeded,
    /// Completed; the recorded outcome is the error.
    Failed,
    /// Completed after a stop request.
    Stopped,
    /// Completed after an abort request; partial results were discarded.
    Aborted,
}

impl ExecutionState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }
}

/// Cooperative stop/abort flags shared between a future and its event.
#[derive(Default)]
pub(crate) struct ControlFlags {
    stop: AtomicBool,
    abort: AtomicBool,
}

impl ControlFlags {
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

type Outcome = Result<Box<dyn Any + Send>, Arc<anyhow::Error>>;

struct FutureInner {
    state: ExecutionState,
    outcome: Option<Outcome>,
    notifications: Vec<Notification>,
}

/// State shared between one queued item and its future handles.
pub(crate) struct FutureShared {
    inner: Mutex<FutureInner>,
    cond: Condvar,
}

impl FutureShared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FutureInner {
                state: ExecutionState::Pending,
                outcome: None,
                notifications: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ExecutionState::Pending {
            inner.state = ExecutionState::Running;
        }
    }

    /// Record the outcome and label the terminal state from the request
    /// flags (abort wins over stop), then wake all waiters.
    pub(crate) fn complete(
        &self,
        outcome: Result<Box<dyn Any + Send>, anyhow::Error>,
        control: &ControlFlags,
    ) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = if control.abort_requested() {
            ExecutionState::Aborted
        } else if control.stop_requested() {
            ExecutionState::Stopped
        } else if outcome.is_ok() {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        };
        inner.outcome = Some(outcome.map_err(Arc::new));
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn record_notification(&self, notification: Notification) {
        self.inner.lock().notifications.push(notification);
        self.cond.notify_all();
    }

    pub(crate) fn state(&self) -> ExecutionState {
        self.inner.lock().state
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> EngineResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            match deadline {
                None => self.cond.wait(&mut inner),
                Some(deadline) => {
                    if self.cond.wait_until(&mut inner, deadline).timed_out()
                        && !inner.state.is_terminal()
                    {
                        return Err(EngineError::Timeout);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Create the future, shared state, and control flags for one submission.
pub(crate) fn new_future<T>(
    capabilities: Capabilities,
    handler: Option<DataHandler>,
) -> (EventFuture<T>, Arc<FutureShared>, Arc<ControlFlags>) {
    let shared = Arc::new(FutureShared::new());
    let control = Arc::new(ControlFlags::default());
    let future = EventFuture {
        shared: shared.clone(),
        control: control.clone(),
        capabilities,
        handler,
        _out: PhantomData,
    };
    (future, shared, control)
}

/// Handle to one submitted work item.
///
/// Futures are freely shareable: clones observe the same recorded state,
/// and repeated awaits return the same outcome.
pub struct EventFuture<T> {
    shared: Arc<FutureShared>,
    control: Arc<ControlFlags>,
    capabilities: Capabilities,
    handler: Option<DataHandler>,
    _out: PhantomData<fn() -> T>,
}

impl<T> Clone for EventFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            control: self.control.clone(),
            capabilities: self.capabilities,
            handler: self.handler.clone(),
            _out: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> EventFuture<T> {
    /// Block until the item is terminal; return its result or re-raise the
    /// recorded error.
    pub fn await_execution(&self) -> EngineResult<T> {
        self.await_execution_inner(None)
    }

    /// [`Self::await_execution`] with a timeout.
    pub fn await_execution_for(&self, timeout: Duration) -> EngineResult<T> {
        self.await_execution_inner(Some(timeout))
    }

    fn await_execution_inner(&self, timeout: Option<Duration>) -> EngineResult<T> {
        self.shared.wait_terminal(timeout)?;
        let inner = self.shared.inner.lock();
        match &inner.outcome {
            Some(Ok(value)) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| EngineError::execution(anyhow::anyhow!("result type mismatch"))),
            Some(Err(error)) => Err(EngineError::ExecutionFailed(error.clone())),
            None => Err(EngineError::execution(anyhow::anyhow!(
                "terminal future has no recorded outcome"
            ))),
        }
    }

    /// Whether the item has reached a terminal state. Non-blocking.
    pub fn is_execution_complete(&self) -> bool {
        self.shared.state().is_terminal()
    }

    /// Current lifecycle state. Non-blocking.
    pub fn state(&self) -> ExecutionState {
        self.shared.state()
    }

    /// Snapshot of the notifications recorded on this future so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.inner.lock().notifications.clone()
    }

    /// Block until a notification of exactly `kind` has been recorded;
    /// returns immediately if one already was.
    pub fn await_notification(&self, kind: &str) -> EngineResult<Notification> {
        self.await_notification_inner(kind, None)
    }

    /// [`Self::await_notification`] with a timeout.
    pub fn await_notification_for(&self, kind: &str, timeout: Duration) -> EngineResult<Notification> {
        self.await_notification_inner(kind, Some(timeout))
    }

    fn await_notification_inner(
        &self,
        kind: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<Notification> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(found) = inner.notifications.iter().find(|n| n.kind == kind) {
                return Ok(found.clone());
            }
            match deadline {
                None => self.shared.cond.wait(&mut inner),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut inner, deadline).timed_out()
                        && !inner.notifications.iter().any(|n| n.kind == kind)
                    {
                        return Err(EngineError::Timeout);
                    }
                }
            }
        }
    }

    /// Request a cooperative stop. With `await_completion`, block until the
    /// item is terminal.
    pub fn stop(&self, await_completion: bool) -> EngineResult<()> {
        if !self.capabilities.stoppable {
            return Err(EngineError::CapabilityUnsupported { operation: "stop" });
        }
        self.control.request_stop();
        if await_completion {
            self.shared.wait_terminal(None)?;
        }
        Ok(())
    }

    /// Request a cooperative abort: the event should terminate at its next
    /// safe point, discarding partial results.
    pub fn abort(&self, await_completion: bool) -> EngineResult<()> {
        if !self.capabilities.abortable {
            return Err(EngineError::CapabilityUnsupported { operation: "abort" });
        }
        self.control.request_abort();
        if await_completion {
            self.shared.wait_terminal(None)?;
        }
        Ok(())
    }

    /// Block until the event's handler can serve `coords`, then return the
    /// item. Only valid for data-producing events.
    pub fn await_data(&self, coords: &DataCoordinates) -> EngineResult<DataItem> {
        self.data_handler()?.get(coords)
    }

    /// [`Self::await_data`] with a timeout.
    pub fn await_data_for(&self, coords: &DataCoordinates, timeout: Duration) -> EngineResult<DataItem> {
        self.data_handler()?.get_for(coords, timeout)
    }

    /// Await several coordinates; the returned items preserve the request
    /// order.
    pub fn await_data_many(&self, coords: &[DataCoordinates]) -> EngineResult<Vec<DataItem>> {
        let handler = self.data_handler()?;
        coords.iter().map(|c| handler.get(c)).collect()
    }

    /// Await only the metadata for `coords`.
    pub fn await_metadata(&self, coords: &DataCoordinates) -> EngineResult<Metadata> {
        self.data_handler()?.get_metadata(coords)
    }

    fn data_handler(&self) -> EngineResult<&DataHandler> {
        self.handler
            .as_ref()
            .ok_or(EngineError::CapabilityUnsupported {
                operation: "await_data",
            })
    }
}
