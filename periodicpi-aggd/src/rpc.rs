use std::collections::BTreeMap;
use serde::Deserialize;
use serde_json::{json, Value};
use crate::node::NodeRegistry;
use crate::plugmgr::{kwargs_str, Kwargs, ManagerError, ManagerResult, ModuleManager};

/// One request on the control surface
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Kwargs,
}

/// Operations exposed to remote clients.
#[derive(Clone)]
pub struct RpcSurface {
    manager: ModuleManager,
    registry: NodeRegistry,
}

impl RpcSurface {
    pub fn new(manager: ModuleManager, registry: NodeRegistry) -> Self {
        Self { manager, registry }
    }

    pub fn list_nodes(&self, simple: bool) -> BTreeMap<String, Value> {
        self.registry.list(simple)
    }

    pub fn list_drivers(&self) -> Value {
        json!(self.manager.list_descriptors())
    }

    pub fn module_info(&self, instance: &str) -> ManagerResult<Value> {
        self.manager.module_info(instance)
    }

    pub fn get_property(&self, instance: &str, property: &str) -> ManagerResult<Value> {
        self.manager.get_property(instance, property)
    }

    pub fn set_property(&self, instance: &str, property: &str, value: Value) -> ManagerResult<()> {
        self.manager.set_property(instance, property, value)
    }

    pub fn get_property_list(&self, instance: &str) -> ManagerResult<Value> {
        Ok(json!(self.manager.get_property_list(instance)?))
    }

    pub fn get_method_list(&self, instance: &str) -> ManagerResult<Value> {
        Ok(json!(self.manager.get_method_list(instance)?))
    }

    pub fn call_method(&self, instance: &str, method: &str, args: &Kwargs) -> ManagerResult<Value> {
        self.manager.call_method(instance, method, args)
    }

    /// Invoke a custom method directly, bypassing any driver
    pub fn server_interrupt(&self, key: &str, kwargs: &Kwargs) -> ManagerResult<Value> {
        self.manager.call_custom_method(key, kwargs)
    }

    /// Decode `request.params` for `request.method` and run it
    pub fn dispatch(&self, request: &RpcRequest) -> ManagerResult<Value> {
        let params = &request.params;
        match request.method.as_str() {
            "list_nodes" => {
                let simple = params.get("simple").and_then(Value::as_bool).unwrap_or(false);
                Ok(json!(self.list_nodes(simple)))
            }
            "list_drivers" => Ok(self.list_drivers()),
            "module_info" => self.module_info(kwargs_str(params, "instance")?),
            "get_property" => {
                self.get_property(kwargs_str(params, "instance")?, kwargs_str(params, "property")?)
            }
            "set_property" => {
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| ManagerError::InvalidArguments("value is required".into()))?;
                self.set_property(
                    kwargs_str(params, "instance")?,
                    kwargs_str(params, "property")?,
                    value,
                )?;
                Ok(Value::Null)
            }
            "get_property_list" => self.get_property_list(kwargs_str(params, "instance")?),
            "get_method_list" => self.get_method_list(kwargs_str(params, "instance")?),
            "call_method" => {
                let args = object_param(params, "args")?;
                self.call_method(kwargs_str(params, "instance")?, kwargs_str(params, "method")?, &args)
            }
            "server_interrupt" => {
                let kwargs = object_param(params, "kwargs")?;
                self.server_interrupt(kwargs_str(params, "key")?, &kwargs)
            }
            other => Err(ManagerError::NotAvailable(other.to_string())),
        }
    }
}

/// Optional object parameter; absent or null means empty
fn object_param(params: &Kwargs, key: &str) -> ManagerResult<Kwargs> {
    match params.get(key) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::Null) | None => Ok(Kwargs::new()),
        Some(_) => Err(ManagerError::InvalidArguments(format!("{} must be an object", key))),
    }
}
