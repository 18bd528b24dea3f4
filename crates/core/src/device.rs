//! The contract a device driver implements to be driven by the engine.

use serde::Serialize;
use serde_json::Value;

use crate::error::DeviceError;

/// A hardware device exposed to user code through the engine's proxy layer.
///
/// The engine serializes every proxied access to a device onto the device's
/// assigned worker thread, so implementations see attribute and method
/// traffic one call at a time. Bypassed attributes are the exception: those
/// are serviced on the calling thread, and drivers that opt into bypass
/// must synchronize the touched state themselves.
///
/// Attribute and argument values are JSON values; drivers convert at the
/// edge and reject mismatches with [`DeviceError::InvalidValue`].
pub trait Device: Send + Sync + 'static {
    /// Read the named attribute.
    fn get_attr(&self, name: &str) -> Result<Value, DeviceError>;

    /// Write the named attribute.
    fn set_attr(&self, name: &str, value: Value) -> Result<(), DeviceError>;

    /// Invoke the named method.
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, DeviceError>;

    /// Finite set of accepted values for an attribute, when constrained.
    fn allowed_values(&self, _name: &str) -> Option<Vec<Value>> {
        None
    }

    /// Whether the attribute rejects writes.
    fn is_read_only(&self, _name: &str) -> bool {
        false
    }

    /// Inclusive numeric limits for an attribute, when constrained.
    fn limits(&self, _name: &str) -> Option<(f64, f64)> {
        None
    }

    /// Whether the attribute can be sequenced by a hardware trigger.
    fn is_hardware_triggerable(&self, _name: &str) -> bool {
        false
    }
}

/// Read-only view of one attribute's constraints, gathered on the device's
/// worker via the proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyConstraints {
    /// Finite accepted value set, if any.
    pub allowed_values: Option<Vec<Value>>,
    /// Whether writes are rejected.
    pub read_only: bool,
    /// Inclusive numeric limits, if any.
    pub limits: Option<(f64, f64)>,
    /// Whether a hardware trigger can sequence the attribute.
    pub hardware_triggerable: bool,
}
