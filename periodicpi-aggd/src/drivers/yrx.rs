use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use shared::protocol::{HOOK_NODE_DISCOVERED, HOOK_NODE_REMOVED};
use crate::plugmgr::{
    kwargs_port, kwargs_str, DataType, DeviceRegistry, HookAction, Kwargs, ManagerError,
    ManagerResult, Module, ModuleCapability, ModuleClass, ModuleDescriptor, ModuleHandle,
    PropertyDescriptor, PropertyPermissions,
};
use super::DriverContext;

pub const NAME: &str = "yrx";

static RECEIVER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^RX-A1020 ([0-9]+)").expect("valid regex"));

fn receiver_id(args: &Kwargs) -> Option<&str> {
    let name = args.get("name").and_then(Value::as_str)?;
    RECEIVER_NAME.captures(name).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Yamaha RX-A1020 receiver advertised over mDNS.
struct YamahaReceiver {
    handle: ModuleHandle,
    devices: DeviceRegistry,
    id: String,
    control_url: String,
}

impl Module for YamahaReceiver {
    fn unload(&mut self) {
        self.devices.release(&self.id);
    }

    fn get_property(&self, name: &str) -> ManagerResult<Value> {
        match name {
            "receiver_id" => Ok(json!(self.id)),
            "control_url" => Ok(json!(self.control_url)),
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }
}

fn load(handle: ModuleHandle, args: &Kwargs) -> ManagerResult<YamahaReceiver> {
    let id = receiver_id(args)
        .ok_or_else(|| ManagerError::load(NAME, "not an RX-A1020 advertisement"))?
        .to_string();
    let address = kwargs_str(args, "address")?;
    let port = kwargs_port(args, "port")?;

    let devices = handle.device_registry(NAME)?;
    if !devices.claim(&id) {
        return Err(ManagerError::load(
            NAME,
            format!("receiver with id \"{}\" is already active, not loading", id),
        ));
    }

    let own_id = id.clone();
    let attached = handle.attach_custom_hook(
        HOOK_NODE_REMOVED,
        move |event| receiver_id(event) == Some(own_id.as_str()),
        HookAction::UnloadModule(handle.id().to_string()),
    );
    if let Err(e) = attached {
        devices.release(&id);
        return Err(e);
    }

    handle.log_info(format!("new RX-A1020 receiver with id: {}", id));
    Ok(YamahaReceiver {
        control_url: format!("http://{}:{}/YamahaRemoteControl/ctrl", address, port),
        handle,
        devices,
        id,
    })
}

pub fn discover(ctx: &DriverContext) -> anyhow::Result<ModuleClass> {
    ctx.manager
        .attach_custom_hook(
            HOOK_NODE_DISCOVERED,
            |event| receiver_id(event).is_some(),
            HookAction::LoadModule(NAME.to_string()),
        )
        .with_context(|| format!("could not attach to {}", HOOK_NODE_DISCOVERED))?;

    let descriptor = ModuleDescriptor::new(NAME, "Yamaha RX receiver driver")
        .capability(ModuleCapability::MultiInstanceAllowed)
        .required("address", "node address")
        .required("port", "node port")
        .required("name", "node advertised name")
        .property(PropertyDescriptor::new(
            "receiver_id",
            "Receiver serial from the advertised name",
            PropertyPermissions::Read,
            DataType::String,
        ))
        .property(PropertyDescriptor::new(
            "control_url",
            "YNC control endpoint",
            PropertyPermissions::Read,
            DataType::String,
        ));

    Ok(ModuleClass::new(descriptor, |handle, args| {
        let receiver = load(handle, args)?;
        receiver.handle.log_info(format!("control at {}", receiver.control_url));
        Ok(Box::new(receiver))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing::TestBed;
    use crate::node::FakeScanner;
    use crate::plugmgr::kwargs;

    fn advert(name: &str) -> Kwargs {
        kwargs(json!({
            "iface": "any",
            "proto": "inet",
            "kind": "_http._tcp",
            "name": name,
            "address": "10.0.0.30",
            "port": 80,
        }))
    }

    fn removal(name: &str) -> Kwargs {
        kwargs(json!({"iface": "any", "proto": "inet", "kind": "_http._tcp", "name": name}))
    }

    #[test]
    fn test_duplicate_receiver_refused() {
        let bed = TestBed::new(FakeScanner::default());
        bed.discover(&[NAME]);
        let manager = bed.manager();

        assert_eq!(manager.trigger_custom_hook(HOOK_NODE_DISCOVERED, &advert("RX-A1020 4711")).unwrap(), 1);
        assert_eq!(manager.trigger_custom_hook(HOOK_NODE_DISCOVERED, &advert("RX-A1020 4711")).unwrap(), 1);
        assert_eq!(manager.loaded_instances(), vec!["yrx"]);
        assert_eq!(
            manager.get_property("yrx", "control_url").unwrap(),
            json!("http://10.0.0.30:80/YamahaRemoteControl/ctrl")
        );

        assert!(matches!(
            manager.load_module(NAME, advert("RX-A1020 4711")),
            Err(ManagerError::ModuleLoad { .. })
        ));
        assert_eq!(manager.trigger_custom_hook(HOOK_NODE_DISCOVERED, &advert("PeriodicPi node [alpha]")).unwrap(), 0);
    }

    #[test]
    fn test_removal_releases_id() {
        let bed = TestBed::new(FakeScanner::default());
        bed.discover(&[NAME]);
        let manager = bed.manager();

        let first = manager.load_module(NAME, advert("RX-A1020 4711")).unwrap();
        let other = manager.load_module(NAME, advert("RX-A1020 815")).unwrap();

        manager.trigger_custom_hook(HOOK_NODE_REMOVED, &removal("RX-A1020 4711")).unwrap();
        assert!(!manager.is_loaded(&first));
        assert!(manager.is_loaded(&other));
        assert!(!manager.device_registry(NAME).contains("4711"));

        // the same receiver can come back
        assert!(manager.load_module(NAME, advert("RX-A1020 4711")).is_ok());
    }
}
