//! The device proxy layer.
//!
//! A registered device is reachable only through its [`DeviceProxy`]. Every
//! non-bypassed access synthesizes a structured event, submits it on the
//! device's worker, blocks the caller, and returns the result or re-raises
//! the device error. The worker discipline is the only synchronization
//! devices can rely on for proxied traffic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use exengine_core::{Device, EngineResult, PropertyConstraints};
use serde_json::Value;
use tracing::debug;

use crate::api::Engine;
use crate::event::{Event, EventContext};
use crate::worker::is_current_worker;

/// Registration options for a device.
#[derive(Default)]
pub struct DeviceOptions {
    /// Worker all proxied access runs on; the engine default when `None`.
    pub worker: Option<String>,
    /// Service every access directly on the calling thread.
    pub bypass_all: bool,
    /// Attribute and method names serviced directly on the calling thread.
    pub bypass_attrs: HashSet<String>,
    /// Per-method worker overrides.
    pub method_workers: HashMap<String, String>,
}

impl DeviceOptions {
    /// Pin the device to the named worker.
    pub fn on_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Add a bypassed name.
    pub fn bypass(mut self, name: impl Into<String>) -> Self {
        self.bypass_attrs.insert(name.into());
        self
    }

    /// Route one method to a different worker.
    pub fn method_worker(mut self, method: impl Into<String>, worker: impl Into<String>) -> Self {
        self.method_workers.insert(method.into(), worker.into());
        self
    }
}

/// A registered device and its routing table.
pub(crate) struct DeviceEntry {
    name: String,
    device: Arc<dyn Device>,
    worker: String,
    bypass_all: bool,
    bypass_attrs: HashSet<String>,
    method_workers: HashMap<String, String>,
}

impl DeviceEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Register `device` and hand back its proxy. The engine takes ownership;
/// no direct reference to the device escapes registration.
pub(crate) fn register(
    engine: &Engine,
    name: &str,
    device: Arc<dyn Device>,
    options: DeviceOptions,
) -> EngineResult<DeviceProxy> {
    let worker = options
        .worker
        .unwrap_or_else(|| engine.inner().config().default_worker.clone());
    // Create the worker up front so a bad name fails at registration.
    engine.inner().ensure_worker(&worker)?;
    for method_worker in options.method_workers.values() {
        engine.inner().ensure_worker(method_worker)?;
    }

    let entry = Arc::new(DeviceEntry {
        name: name.to_string(),
        device,
        worker,
        bypass_all: options.bypass_all,
        bypass_attrs: options.bypass_attrs,
        method_workers: options.method_workers,
    });
    engine.inner().insert_device(entry.clone())?;
    debug!(device = %name, worker = %entry.worker, "device registered");

    Ok(DeviceProxy {
        engine: engine.clone(),
        entry,
    })
}

pub(crate) fn proxy_for(engine: &Engine, entry: Arc<DeviceEntry>) -> DeviceProxy {
    DeviceProxy {
        engine: engine.clone(),
        entry,
    }
}

/// Synchronous handle to a registered device.
///
/// Reads, writes and calls behave as if the device were a plain local
/// object; the observable side effects occur on the device's worker.
#[derive(Clone)]
pub struct DeviceProxy {
    engine: Engine,
    entry: Arc<DeviceEntry>,
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("name", &self.entry.name())
            .finish()
    }
}

impl DeviceProxy {
    /// The registration name.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// The worker serving this device's non-overridden access.
    pub fn worker(&self) -> &str {
        &self.entry.worker
    }

    /// Read an attribute on the device's worker.
    pub fn get(&self, attr: &str) -> EngineResult<Value> {
        let worker = self.resolve_worker(attr);
        if self.serviced_inline(attr, worker) {
            return Ok(self.entry.device.get_attr(attr)?);
        }
        let future = self.engine.submit_on(
            worker,
            GetAttr {
                entry: self.entry.clone(),
                attr: attr.to_string(),
            },
        )?;
        future.await_execution()
    }

    /// Write an attribute on the device's worker.
    pub fn set(&self, attr: &str, value: Value) -> EngineResult<()> {
        let worker = self.resolve_worker(attr);
        if self.serviced_inline(attr, worker) {
            return Ok(self.entry.device.set_attr(attr, value)?);
        }
        let future = self.engine.submit_on(
            worker,
            SetAttr {
                entry: self.entry.clone(),
                attr: attr.to_string(),
                value: Some(value),
            },
        )?;
        future.await_execution()
    }

    /// Invoke a method on the device's worker (or its override worker).
    pub fn call(&self, method: &str, args: Vec<Value>) -> EngineResult<Value> {
        let worker = self.resolve_worker(method);
        if self.serviced_inline(method, worker) {
            return Ok(self.entry.device.call(method, args)?);
        }
        let future = self.engine.submit_on(
            worker,
            MethodCall {
                entry: self.entry.clone(),
                method: method.to_string(),
                args: Some(args),
            },
        )?;
        future.await_execution()
    }

    /// Read-only view of an attribute's constraints, gathered on the
    /// device's worker.
    pub fn constraints(&self, attr: &str) -> EngineResult<PropertyConstraints> {
        let worker = self.resolve_worker(attr);
        if self.serviced_inline(attr, worker) {
            return Ok(gather_constraints(&*self.entry.device, attr));
        }
        let future = self.engine.submit_on(
            worker,
            Introspect {
                entry: self.entry.clone(),
                attr: attr.to_string(),
            },
        )?;
        future.await_execution()
    }

    fn resolve_worker(&self, name: &str) -> &str {
        self.entry
            .method_workers
            .get(name)
            .map(String::as_str)
            .unwrap_or(&self.entry.worker)
    }

    /// Bypassed names run on the calling thread; so do re-entrant calls
    /// made from the target worker itself, which must not re-enqueue.
    fn serviced_inline(&self, name: &str, worker: &str) -> bool {
        self.entry.bypass_all
            || self.entry.bypass_attrs.contains(name)
            || is_current_worker(worker)
    }
}

fn gather_constraints(device: &dyn Device, attr: &str) -> PropertyConstraints {
    PropertyConstraints {
        allowed_values: device.allowed_values(attr),
        read_only: device.is_read_only(attr),
        limits: device.limits(attr),
        hardware_triggerable: device.is_hardware_triggerable(attr),
    }
}

/// Synthesized event for a proxied attribute read.
struct GetAttr {
    entry: Arc<DeviceEntry>,
    attr: String,
}

impl Event for GetAttr {
    type Output = Value;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<Value> {
        self.entry
            .device
            .get_attr(&self.attr)
            .map_err(|err| device_failure(&self.entry.name, &self.attr, err))
    }
}

/// Synthesized event for a proxied attribute write.
struct SetAttr {
    entry: Arc<DeviceEntry>,
    attr: String,
    value: Option<Value>,
}

impl Event for SetAttr {
    type Output = ();

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<()> {
        let value = self
            .value
            .take()
            .ok_or_else(|| anyhow::anyhow!("attribute write already executed"))?;
        self.entry
            .device
            .set_attr(&self.attr, value)
            .map_err(|err| device_failure(&self.entry.name, &self.attr, err))
    }
}

/// Synthesized event for a proxied method call.
struct MethodCall {
    entry: Arc<DeviceEntry>,
    method: String,
    args: Option<Vec<Value>>,
}

impl Event for MethodCall {
    type Output = Value;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<Value> {
        let args = self
            .args
            .take()
            .ok_or_else(|| anyhow::anyhow!("method call already executed"))?;
        self.entry
            .device
            .call(&self.method, args)
            .map_err(|err| device_failure(&self.entry.name, &self.method, err))
    }
}

/// Synthesized event gathering property constraints.
struct Introspect {
    entry: Arc<DeviceEntry>,
    attr: String,
}

impl Event for Introspect {
    type Output = PropertyConstraints;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<PropertyConstraints> {
        Ok(gather_constraints(&*self.entry.device, &self.attr))
    }
}

/// Wrap a device error with the access context, keeping the `DeviceError`
/// in the chain for downcasting.
fn device_failure(
    device: &str,
    name: &str,
    err: exengine_core::DeviceError,
) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("device `{device}`, access `{name}`"))
}
