#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared contracts for the exengine runtime.
//!
//! This crate holds the types exchanged between the engine and its external
//! collaborators: coordinates and data items, the notification model and its
//! wire format, the typed error surface, and the traits implemented by
//! device drivers and storage backends.

pub mod coords;
pub mod device;
pub mod error;
pub mod item;
pub mod notification;
pub mod storage;

pub use coords::{AxisDomain, AxisSpace, AxisValue, CoordinateList, CoordinateSequence, DataCoordinates};
pub use device::{Device, PropertyConstraints};
pub use error::{DeviceError, EngineError, EngineResult};
pub use item::{DataItem, Metadata};
pub use notification::{kinds, Notification, NotificationCategory, NotificationFilter};
pub use storage::Storage;
