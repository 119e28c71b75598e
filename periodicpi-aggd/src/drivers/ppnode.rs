//! Gateway driver for PeriodicPi nodes.
//!
//! An instance is loaded for every advertisement whose name parses as a
//! node. Construction scans the node, loads a driver per recognised service
//! and publishes the node in the registry; unloading takes all of that down
//! again.

use std::sync::Arc;
use anyhow::Context;
use serde_json::{json, Value};
use shared::protocol::{
    HOOK_NODE_DISCOVERED, HOOK_NODE_REMOVED, METHOD_ADD_ACTIVE_NODE, METHOD_DEL_ACTIVE_NODE,
    METHOD_HAS_ACTIVE_NODE,
};
use crate::node::{parse_node_element, Node, NodeScanner};
use crate::plugmgr::{
    kwargs, kwargs_port, kwargs_str, DataType, HookAction, Kwargs, ManagerError, ManagerResult,
    MethodDescriptor, Module, ModuleCapability, ModuleClass, ModuleDescriptor, ModuleHandle,
    PropertyDescriptor, PropertyPermissions, WeakModuleManager,
};
use super::DriverContext;

pub const NAME: &str = "ppnode";

struct PpNode {
    handle: ModuleHandle,
    node: Node,
}

/// Best effort: a driver that fails to unload must not keep the others up
fn unload_plugins(handle: &ModuleHandle, instances: &[String]) {
    for id in instances {
        if let Err(e) = handle.unload_module(id) {
            handle.log_warning(format!("could not unload {}: {}", id, e));
        }
    }
}

impl PpNode {
    fn load(handle: ModuleHandle, args: &Kwargs, scanner: &dyn NodeScanner) -> ManagerResult<Self> {
        let address = kwargs_str(args, "address")?;
        let port = kwargs_port(args, "port")?;
        let name = kwargs_str(args, "name")?;
        let element = parse_node_element(name)
            .ok_or_else(|| ManagerError::load(NAME, format!("{:?} is not a node name", name)))?;

        let mut node = Node::new(element, address, port);
        node.register_basic_information(scanner)
            .map_err(|e| ManagerError::driver(handle.id(), e))?;

        let registered = node
            .register_services(scanner, &handle)
            .map_err(|e| ManagerError::driver(handle.id(), e))
            .and_then(|()| Self::activate(&handle, args, &mut node));

        if let Err(e) = registered {
            unload_plugins(&handle, &node.plugin_instances());
            return Err(e);
        }

        handle.log_info(format!("new Periodic Pi node: {}", node.element));
        Ok(Self { handle, node })
    }

    fn activate(handle: &ModuleHandle, args: &Kwargs, node: &mut Node) -> ManagerResult<()> {
        node.attach_gateway(handle.id())
            .map_err(|e| ManagerError::driver(handle.id(), e))?;

        // removal events carry no address; name, kind and proto identify the advertisement
        let name = args.get("name").cloned();
        let kind = args.get("kind").cloned();
        let proto = args.get("proto").cloned();
        handle.attach_custom_hook(
            HOOK_NODE_REMOVED,
            move |event| {
                event.get("name") == name.as_ref()
                    && event.get("kind") == kind.as_ref()
                    && event.get("proto") == proto.as_ref()
            },
            HookAction::UnloadModule(handle.id().to_string()),
        )?;

        handle.call_custom_method(
            METHOD_ADD_ACTIVE_NODE,
            &kwargs(json!({ "element": node.element, "node": node })),
        )?;
        Ok(())
    }

    fn own_plugin<'a>(&self, args: &'a Kwargs) -> ManagerResult<&'a str> {
        let instance = kwargs_str(args, "instance_name")?;
        if !self.node.plugin_instances().iter().any(|id| id == instance) {
            return Err(ManagerError::NotAvailable(format!(
                "{} is not a plugin of node {}",
                instance, self.node.element
            )));
        }
        Ok(instance)
    }
}

impl Module for PpNode {
    fn unload(&mut self) {
        let args = kwargs(json!({ "element": self.node.element }));
        if let Err(e) = self.handle.call_custom_method(METHOD_DEL_ACTIVE_NODE, &args) {
            self.handle.log_warning(format!("could not remove node from registry: {}", e));
        }
        unload_plugins(&self.handle, &self.node.plugin_instances());
        self.handle.log_info(format!("node {} gone", self.node.element));
    }

    fn get_property(&self, name: &str) -> ManagerResult<Value> {
        match name {
            "node_element" => Ok(json!(self.node.element)),
            "node_plugins" => Ok(json!(self.node.plugin_instances())),
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }

    fn call_method(&mut self, name: &str, args: &Kwargs) -> ManagerResult<Value> {
        match name {
            "call_plugin_method" => {
                let instance = self.own_plugin(args)?;
                let method = kwargs_str(args, "method_name")?;
                let method_args = match args.get("method_args") {
                    Some(Value::Object(map)) => map.clone(),
                    Some(Value::Null) | None => Kwargs::new(),
                    Some(_) => {
                        return Err(ManagerError::InvalidArguments(
                            "method_args must be an object".into(),
                        ))
                    }
                };
                self.handle.call_method(instance, method, &method_args)
            }
            "inspect_plugin" => {
                let instance = self.own_plugin(args)?;
                self.handle.module_info(instance)
            }
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }
}

/// Load only for node advertisements whose element is not already active
fn is_new_node(manager: &WeakModuleManager, event: &Kwargs) -> bool {
    let Some(element) = event.get("name").and_then(Value::as_str).and_then(parse_node_element) else {
        return false;
    };
    let Some(manager) = manager.upgrade() else {
        return false;
    };
    match manager.call_custom_method(METHOD_HAS_ACTIVE_NODE, &kwargs(json!({ "element": element }))) {
        Ok(active) => !active.as_bool().unwrap_or(false),
        // no registry to ask; let the load itself sort out duplicates
        Err(_) => true,
    }
}

fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, "PeriodicPi node driver")
        .capability(ModuleCapability::MultiInstanceAllowed)
        .required("address", "node address")
        .required("port", "node port")
        .required("name", "node advertised name")
        .property(PropertyDescriptor::new(
            "node_element",
            "Node identifying element",
            PropertyPermissions::Read,
            DataType::String,
        ))
        .property(PropertyDescriptor::new(
            "node_plugins",
            "Plugins active at node",
            PropertyPermissions::Read,
            DataType::StringList,
        ))
        .method(
            MethodDescriptor::new("call_plugin_method", "Call a method provided by a node plugin", DataType::Void)
                .arg("instance_name", "Plugin instance name", true, DataType::String)
                .arg("method_name", "Method name", true, DataType::String)
                .arg("method_args", "Method arguments", false, DataType::Dict),
        )
        .method(
            MethodDescriptor::new("inspect_plugin", "Inspect plugin structure", DataType::Dict)
                .arg("instance_name", "Plugin instance name", true, DataType::String),
        )
}

pub fn discover(ctx: &DriverContext) -> anyhow::Result<ModuleClass> {
    let manager = ctx.manager.downgrade();
    ctx.manager
        .attach_custom_hook(
            HOOK_NODE_DISCOVERED,
            move |event| is_new_node(&manager, event),
            HookAction::LoadModule(NAME.to_string()),
        )
        .with_context(|| format!("could not attach to {}", HOOK_NODE_DISCOVERED))?;

    let scanner: Arc<dyn NodeScanner> = ctx.scanner.clone();
    Ok(ModuleClass::new(descriptor(), move |handle, args| {
        Ok(Box::new(PpNode::load(handle, args, scanner.as_ref())?))
    }))
}
