//! Hook-based driver manager.
//!
//! Drivers are described by a [`ModuleDescriptor`] and built by a factory
//! registered in the catalog. Discovery engines feed events into named hooks;
//! handlers attached to those hooks decide, in attachment order, which
//! drivers to load or unload. Drivers talk back to the manager through the
//! [`ModuleHandle`] they receive at construction.

mod descriptor;
mod error;
mod hook;
mod manager;

pub use descriptor::{
    DataType, MethodDescriptor, Module, ModuleCapability, ModuleClass, ModuleDescriptor,
    PropertyDescriptor, PropertyPermissions,
};
pub use error::{ManagerError, ManagerResult};
pub use hook::HookAction;
pub use manager::{DeviceRegistry, ModuleHandle, ModuleManager, WeakModuleManager};

use serde_json::Value;

/// Keyword arguments carried by hook events, load requests and method calls.
pub type Kwargs = serde_json::Map<String, Value>;

/// Build a [`Kwargs`] from a `json!` object; anything else yields an empty map
pub fn kwargs(value: Value) -> Kwargs {
    match value {
        Value::Object(map) => map,
        _ => Kwargs::new(),
    }
}

pub fn kwargs_str<'a>(kwargs: &'a Kwargs, key: &str) -> ManagerResult<&'a str> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ManagerError::InvalidArguments(format!("{} must be a string", key)))
}

/// Read a port that may have been passed as a number or a numeric string
pub fn kwargs_port(kwargs: &Kwargs, key: &str) -> ManagerResult<u16> {
    let port = match kwargs.get(key) {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    port.ok_or_else(|| ManagerError::InvalidArguments(format!("{} must be a port number", key)))
}
