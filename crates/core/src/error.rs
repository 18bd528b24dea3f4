//! The typed error surface of the engine.

use std::sync::Arc;

use crate::coords::DataCoordinates;

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine, its futures, and the data pipeline.
///
/// Failures raised by user code (events, devices, storage backends,
/// processors) are carried as `anyhow` errors behind an `Arc` so a single
/// recorded failure can be re-raised to every waiter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine was shut down; no further submissions are accepted.
    #[error("engine is shut down")]
    ShutDown,

    /// The named worker's queue is at its configured capacity.
    #[error("worker queue `{worker}` is full (capacity {capacity})")]
    QueueFull {
        /// Worker whose queue rejected the item.
        worker: String,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread `{worker}`")]
    WorkerSpawn {
        /// Worker that failed to start.
        worker: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A device with the same name is already registered.
    #[error("device `{name}` is already registered")]
    DuplicateDevice {
        /// The conflicting registration name.
        name: String,
    },

    /// The event's `execute` returned an error; re-raised by
    /// `await_execution` on every call.
    #[error("event execution failed: {0:#}")]
    ExecutionFailed(Arc<anyhow::Error>),

    /// A capability method was called on a future whose event does not
    /// carry that capability.
    #[error("event does not support `{operation}`")]
    CapabilityUnsupported {
        /// The refused operation (`stop`, `abort`, `await_data`).
        operation: &'static str,
    },

    /// The handler can prove these coordinates will never be produced.
    #[error("coordinates {0} will never be produced")]
    UnknownCoordinates(DataCoordinates),

    /// An await expired without altering the awaited state.
    #[error("timed out")]
    Timeout,

    /// The data handler no longer accepts puts.
    #[error("data handler is finished")]
    HandlerFinished,

    /// The storage backend or a pipeline thread failed; also broadcast as
    /// a `StorageFailed` notification.
    #[error("storage failed: {0:#}")]
    Storage(Arc<anyhow::Error>),

    /// A device raised on direct (bypassed or inline) attribute access.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl EngineError {
    /// Wrap a user-code failure for recording on a future.
    pub fn execution(error: anyhow::Error) -> Self {
        EngineError::ExecutionFailed(Arc::new(error))
    }
}

/// Errors raised by device drivers.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device has no such attribute.
    #[error("unknown attribute `{name}`")]
    UnknownAttribute {
        /// Requested attribute.
        name: String,
    },

    /// The device has no such method.
    #[error("unknown method `{name}`")]
    UnknownMethod {
        /// Requested method.
        name: String,
    },

    /// The attribute cannot be written.
    #[error("attribute `{name}` is read-only")]
    ReadOnly {
        /// Attribute that rejected the write.
        name: String,
    },

    /// The value is outside the attribute's constraints.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidValue {
        /// Attribute that rejected the value.
        name: String,
        /// Driver-supplied reason.
        reason: String,
    },

    /// The underlying hardware or its binding failed.
    #[error("hardware failure: {0:#}")]
    Hardware(anyhow::Error),
}

impl From<anyhow::Error> for DeviceError {
    fn from(error: anyhow::Error) -> Self {
        DeviceError::Hardware(error)
    }
}
