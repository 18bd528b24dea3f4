//! Broadcast of notifications to external subscribers.
//!
//! Publication never blocks the publisher: notifications land on a bounded
//! queue drained by a dedicated dispatch thread that invokes the matching
//! handlers. Slow handlers slow only the dispatch thread; panicking
//! handlers are logged and stay subscribed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use exengine_core::{Notification, NotificationFilter};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

type Handler = Box<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: NotificationFilter,
    handler: Handler,
}

enum BusMsg {
    Publish(Notification),
    Stop,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    tx: Sender<BusMsg>,
    next_id: AtomicU64,
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
}

#[derive(Clone)]
pub(crate) struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Start the bus and its dispatch thread.
    pub(crate) fn start(queue_depth: usize) -> (Self, Option<JoinHandle<()>>) {
        let (tx, rx) = bounded(queue_depth.max(1));
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(0),
        });

        let dispatch_inner = inner.clone();
        let join = std::thread::Builder::new()
            .name("exengine-notify".to_string())
            .spawn(move || dispatch(&dispatch_inner, &rx));
        let join = match join {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to spawn notification dispatch thread");
                None
            }
        };

        (Self { inner }, join)
    }

    /// Enqueue for dispatch. Never blocks; a full queue drops the
    /// notification.
    pub(crate) fn publish(&self, notification: Notification) {
        match self.inner.tx.try_send(BusMsg::Publish(notification)) {
            Ok(()) => {}
            Err(TrySendError::Full(BusMsg::Publish(n))) => {
                warn!(kind = %n.kind, "notification queue full; dropping notification");
            }
            Err(_) => {}
        }
    }

    pub(crate) fn subscribe(&self, filter: NotificationFilter, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Subscriber {
            id,
            filter,
            handler,
        });
        Subscription { id }
    }

    pub(crate) fn unsubscribe(&self, subscription: &Subscription) {
        self.inner
            .subscribers
            .write()
            .retain(|s| s.id != subscription.id);
    }

    /// Ask the dispatch thread to exit once the queue is drained.
    pub(crate) fn stop(&self) {
        let _ = self.inner.tx.send(BusMsg::Stop);
    }
}

fn dispatch(inner: &BusInner, rx: &Receiver<BusMsg>) {
    debug!("notification dispatch started");
    for msg in rx.iter() {
        match msg {
            BusMsg::Publish(notification) => {
                let subscribers = inner.subscribers.read();
                for subscriber in subscribers.iter() {
                    if !subscriber.filter.matches(&notification) {
                        continue;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        (subscriber.handler)(&notification);
                    }));
                    if result.is_err() {
                        error!(
                            kind = %notification.kind,
                            subscriber = subscriber.id,
                            "notification handler panicked"
                        );
                    }
                }
            }
            BusMsg::Stop => break,
        }
    }
    debug!("notification dispatch stopped");
}
