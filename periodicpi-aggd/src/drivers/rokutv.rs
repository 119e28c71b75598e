use std::sync::Arc;
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use shared::protocol::{
    HOOK_SSDP_DISCOVERED, HOOK_SSDP_REMOVED, METHOD_ADD_SSDP_SEARCH, SSDP_MULTICAST_ADDR,
    SSDP_MULTICAST_PORT,
};
use crate::node::DeviceClient;
use crate::plugmgr::{
    kwargs, kwargs_str, DataType, HookAction, Kwargs, ManagerError, ManagerResult,
    MethodDescriptor, Module, ModuleCapability, ModuleClass, ModuleDescriptor, ModuleHandle,
    PropertyDescriptor, PropertyPermissions,
};
use super::DriverContext;

pub const NAME: &str = "rokutv";

const SEARCH_TARGET: &str = "roku:ecp";

static ROKU_USN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"uuid:roku:ecp:([0-9A-Za-z]+)").expect("valid regex"));

const ALLOWED_KEYS: &[&str] = &[
    "home", "rev", "fwd", "play", "select", "left", "right", "down", "up", "back",
    "instantreplay", "info", "backspace", "search", "enter", "volumeup", "volumedown",
    "volumemute",
];

fn tv_uuid(usn: &str) -> Option<&str> {
    ROKU_USN.captures(usn).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn event_uuid(args: &Kwargs) -> Option<&str> {
    args.get("USN").and_then(Value::as_str).and_then(tv_uuid)
}

/// Roku TV controlled through its External Control Protocol.
struct RokuTv {
    handle: ModuleHandle,
    client: Arc<dyn DeviceClient>,
    /// Base URL from the LOCATION header, always ending in '/'
    location: String,
    uuid: String,
}

impl RokuTv {
    fn post(&self, path: &str) -> ManagerResult<Value> {
        let url = format!("{}{}", self.location, path);
        self.client
            .post(&url)
            .map_err(|e| ManagerError::driver(self.handle.id(), e))?;
        Ok(Value::Null)
    }

    fn key(args: &Kwargs) -> ManagerResult<&str> {
        let key = kwargs_str(args, "key_name")?;
        if !ALLOWED_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
            return Err(ManagerError::InvalidArguments(format!("unknown key {}", key)));
        }
        Ok(key)
    }
}

impl Module for RokuTv {
    fn get_property(&self, name: &str) -> ManagerResult<Value> {
        match name {
            "tv_uuid" => Ok(json!(self.uuid)),
            "location" => Ok(json!(self.location)),
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }

    fn call_method(&mut self, name: &str, args: &Kwargs) -> ManagerResult<Value> {
        match name {
            "send_remote_key" => self.post(&format!("keypress/{}", Self::key(args)?)),
            "start_key_press" => self.post(&format!("keydown/{}", Self::key(args)?)),
            "stop_key_press" => self.post(&format!("keyup/{}", Self::key(args)?)),
            "launch_app" => self.post(&format!("launch/{}", kwargs_str(args, "app_id")?)),
            "send_text_key" => {
                let text = kwargs_str(args, "char")?;
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => {
                        self.post(&format!("keypress/lit_{}", c))
                    }
                    _ => Err(ManagerError::InvalidArguments(format!(
                        "char must be one letter or digit, got {:?}",
                        text
                    ))),
                }
            }
            _ => Err(ManagerError::NotAvailable(name.to_string())),
        }
    }
}

fn descriptor() -> ModuleDescriptor {
    let key_method = |name: &str, help: &str| {
        MethodDescriptor::new(name, help, DataType::Void).arg(
            "key_name",
            "remote key, e.g. home or volumeup",
            true,
            DataType::String,
        )
    };

    ModuleDescriptor::new(NAME, "Roku TV driver")
        .capability(ModuleCapability::MultiInstanceAllowed)
        .required("LOCATION", "tv address")
        .required("USN", "tv unique service name")
        .property(PropertyDescriptor::new("tv_uuid", "TV identifier", PropertyPermissions::Read, DataType::String))
        .property(PropertyDescriptor::new("location", "ECP base URL", PropertyPermissions::Read, DataType::String))
        .method(key_method("send_remote_key", "Press and release a key"))
        .method(key_method("start_key_press", "Hold a key down"))
        .method(key_method("stop_key_press", "Release a held key"))
        .method(
            MethodDescriptor::new("launch_app", "Launch a channel", DataType::Void)
                .arg("app_id", "channel id", true, DataType::String),
        )
        .method(
            MethodDescriptor::new("send_text_key", "Type one character", DataType::Void)
                .arg("char", "character to type", true, DataType::String),
        )
}

fn load(handle: ModuleHandle, args: &Kwargs, client: Arc<dyn DeviceClient>) -> ManagerResult<RokuTv> {
    let usn = kwargs_str(args, "USN")?;
    let uuid = tv_uuid(usn)
        .ok_or_else(|| ManagerError::load(NAME, format!("{} is not a Roku ECP service", usn)))?
        .to_string();

    let mut location = kwargs_str(args, "LOCATION")?.to_string();
    if !location.ends_with('/') {
        location.push('/');
    }

    let own_uuid = uuid.clone();
    handle.attach_custom_hook(
        HOOK_SSDP_REMOVED,
        move |event| event_uuid(event) == Some(own_uuid.as_str()),
        HookAction::UnloadModule(handle.id().to_string()),
    )?;

    handle.log_info(format!("Roku TV {} at {}", uuid, location));
    Ok(RokuTv {
        handle,
        client,
        location,
        uuid,
    })
}

pub fn discover(ctx: &DriverContext) -> anyhow::Result<ModuleClass> {
    ctx.manager
        .call_custom_method(
            METHOD_ADD_SSDP_SEARCH,
            &kwargs(json!({
                "host": SSDP_MULTICAST_ADDR,
                "port": SSDP_MULTICAST_PORT,
                "service_type": SEARCH_TARGET,
            })),
        )
        .context("could not register the roku:ecp search")?;

    ctx.manager
        .attach_custom_hook(
            HOOK_SSDP_DISCOVERED,
            |event| event_uuid(event).is_some(),
            HookAction::LoadModule(NAME.to_string()),
        )
        .with_context(|| format!("could not attach to {}", HOOK_SSDP_DISCOVERED))?;

    let client = ctx.client.clone();
    Ok(ModuleClass::new(descriptor(), move |handle, args| {
        Ok(Box::new(load(handle, args, client.clone())?))
    }))
}
