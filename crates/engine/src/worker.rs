//! Worker threads: one named OS thread per queue, strictly FIFO.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use exengine_core::Notification;
use tracing::debug;

use crate::bus::NotificationBus;
use crate::event::{ErasedEvent, EventContext};
use crate::future::{ControlFlags, FutureShared};

thread_local! {
    // Name of the worker this thread belongs to, for re-entrancy detection.
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Whether the calling thread is the worker named `name`.
pub(crate) fn is_current_worker(name: &str) -> bool {
    CURRENT_WORKER.with(|w| w.borrow().as_deref() == Some(name))
}

pub(crate) enum WorkerCommand {
    Run(QueuedItem),
    Stop,
}

/// One type-erased work item plus the state its future shares.
pub(crate) struct QueuedItem {
    pub(crate) event: Box<dyn ErasedEvent>,
    pub(crate) shared: Arc<FutureShared>,
    pub(crate) control: Arc<ControlFlags>,
    /// Structured events publish a terminal `EventExecuted`; plain
    /// callables do not.
    pub(crate) emit_terminal: bool,
    pub(crate) declared: Box<[&'static str]>,
}

pub(crate) fn run_worker(
    name: String,
    rx: Receiver<WorkerCommand>,
    cancel: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    bus: NotificationBus,
) {
    CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(name.clone()));
    debug!(worker = %name, "worker started");

    for command in rx.iter() {
        match command {
            WorkerCommand::Stop => break,
            WorkerCommand::Run(item) => {
                if cancel.load(Ordering::SeqCst) {
                    cancel_item(item, &bus);
                    continue;
                }
                busy.store(true, Ordering::SeqCst);
                run_item(item, &bus);
                busy.store(false, Ordering::SeqCst);
            }
        }
    }

    debug!(worker = %name, "worker stopped");
}

/// Run one item. Failures and panics are attributed to the item's future;
/// the worker itself never dies.
fn run_item(item: QueuedItem, bus: &NotificationBus) {
    let QueuedItem {
        event,
        shared,
        control,
        emit_terminal,
        declared,
    } = item;

    shared.mark_running();
    let ctx = EventContext::new(control.clone(), shared.clone(), bus.clone(), declared);
    let outcome = match catch_unwind(AssertUnwindSafe(|| event.run(&ctx))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("event panicked: {}", panic_message(panic.as_ref()))),
    };

    let error = outcome.as_ref().err().map(|e| format!("{e:#}"));
    shared.complete(outcome, &control);
    if emit_terminal {
        publish_terminal(&shared, bus, error.as_deref());
    }
}

/// Fail a queued item that was cancelled by `shutdown(false)`.
fn cancel_item(item: QueuedItem, bus: &NotificationBus) {
    let error = "cancelled before execution by engine shutdown";
    item.shared
        .complete(Err(anyhow::anyhow!(error)), &item.control);
    if item.emit_terminal {
        publish_terminal(&item.shared, bus, Some(error));
    }
}

fn publish_terminal(shared: &FutureShared, bus: &NotificationBus, error: Option<&str>) {
    let notification = Notification::event_executed(error);
    shared.record_notification(notification.clone());
    bus.publish(notification);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
