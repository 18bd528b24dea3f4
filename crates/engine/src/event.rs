//! Events: units of work with typed results and optional capabilities.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use exengine_core::Notification;
use tracing::warn;

use crate::bus::NotificationBus;
use crate::data::DataHandler;
use crate::future::{ControlFlags, FutureShared};

/// Optional capabilities of an event, checked by its future at call time.
///
/// The flags are independent; an event may carry any combination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The event polls `is_stop_requested` and can finish early.
    pub stoppable: bool,
    /// The event polls `is_abort_requested` and can discard partial work.
    pub abortable: bool,
    /// The event puts items into a data handler while executing.
    pub data_producing: bool,
}

impl Capabilities {
    /// No capabilities; the default for plain work.
    pub const NONE: Capabilities = Capabilities {
        stoppable: false,
        abortable: false,
        data_producing: false,
    };

    /// Enable cooperative stop.
    pub fn stoppable(mut self) -> Self {
        self.stoppable = true;
        self
    }

    /// Enable cooperative abort.
    pub fn abortable(mut self) -> Self {
        self.abortable = true;
        self
    }

    /// Mark the event as producing data through a handler.
    pub fn data_producing(mut self) -> Self {
        self.data_producing = true;
        self
    }
}

/// A unit of work executed on exactly one worker.
///
/// Ownership moves into the engine at submission, so an event instance
/// cannot be submitted twice. The output must be `Clone` because every
/// `await_execution` call on the future observes the same recorded value.
pub trait Event: Send + 'static {
    /// Result type recorded on the future.
    type Output: Clone + Send + 'static;

    /// Run the work. Called exactly once, on the event's worker thread.
    fn execute(&mut self, ctx: &EventContext) -> anyhow::Result<Self::Output>;

    /// Notification kinds this event may publish. Publishing an unlisted
    /// kind is logged but not rejected.
    fn notification_kinds(&self) -> &[&'static str] {
        &[]
    }

    /// Worker this event prefers when submitted without an explicit worker.
    fn preferred_worker(&self) -> Option<&str> {
        None
    }

    /// Capability flags for this event.
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// The handler receiving this event's data, for data-producing events.
    fn data_handler(&self) -> Option<DataHandler> {
        None
    }
}

/// Execution-side view of a running event: cooperative flags and the
/// notification channel.
pub struct EventContext {
    control: Arc<ControlFlags>,
    shared: Arc<FutureShared>,
    bus: NotificationBus,
    declared: Box<[&'static str]>,
}

impl EventContext {
    pub(crate) fn new(
        control: Arc<ControlFlags>,
        shared: Arc<FutureShared>,
        bus: NotificationBus,
        declared: Box<[&'static str]>,
    ) -> Self {
        Self {
            control,
            shared,
            bus,
            declared,
        }
    }

    /// Whether a cooperative stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.control.stop_requested()
    }

    /// Whether a cooperative abort has been requested.
    pub fn is_abort_requested(&self) -> bool {
        self.control.abort_requested()
    }

    /// Record `notification` on the event's future and broadcast it.
    pub fn publish(&self, notification: Notification) {
        if !self.declared.iter().any(|kind| *kind == notification.kind) {
            warn!(kind = %notification.kind, "event published an undeclared notification kind");
        }
        self.shared.record_notification(notification.clone());
        self.bus.publish(notification);
    }
}

/// Object-safe form of an event, queued on a worker.
pub(crate) trait ErasedEvent: Send {
    fn run(self: Box<Self>, ctx: &EventContext) -> anyhow::Result<Box<dyn Any + Send>>;
}

impl<E: Event> ErasedEvent for E {
    fn run(mut self: Box<Self>, ctx: &EventContext) -> anyhow::Result<Box<dyn Any + Send>> {
        self.execute(ctx).map(|out| Box::new(out) as Box<dyn Any + Send>)
    }
}

/// Adapter running a plain closure as an event. No capabilities, no
/// notifications, no terminal notification.
pub(crate) struct Callable<F, R> {
    f: Option<F>,
    _out: PhantomData<fn() -> R>,
}

impl<F, R> Callable<F, R> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f: Some(f),
            _out: PhantomData,
        }
    }
}

impl<F, R> Event for Callable<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Clone + Send + 'static,
{
    type Output = R;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<R> {
        match self.f.take() {
            Some(f) => Ok(f()),
            None => Err(anyhow::anyhow!("callable already executed")),
        }
    }
}
