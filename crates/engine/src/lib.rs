#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process execution engine for laboratory instrument control.
//!
//! User code addresses registered devices as plain synchronous objects;
//! underneath, every access is serialized onto named single-worker queues
//! that also run richer events producing futures, notifications, and
//! indexed data streams.

/// Public API for the engine crate.
pub mod api;

mod bus;
mod data;
mod engine;
mod event;
mod future;
mod proxy;
mod worker;

pub use api::{Engine, EngineConfig, EngineStatus, WorkerSnapshot};
pub use bus::Subscription;
pub use data::{DataHandler, DataProcessor, EvictionPolicy, HandlerOptions};
pub use event::{Capabilities, Event, EventContext};
pub use future::{EventFuture, ExecutionState};
pub use proxy::{DeviceOptions, DeviceProxy};

pub use exengine_core::{
    kinds, AxisDomain, AxisSpace, AxisValue, CoordinateList, CoordinateSequence, DataCoordinates,
    DataItem, Device, DeviceError, EngineError, EngineResult, Metadata, Notification,
    NotificationCategory, NotificationFilter, PropertyConstraints, Storage,
};
