//! Compiled-in drivers.
//!
//! Each entry's `discover` function is called once when the manifest is
//! scanned. It may attach hooks or register SSDP searches through the
//! manager, and returns the class the manager adds to its catalog.

mod lircd;
mod ppnode;
mod rokutv;
mod snapclient;
mod yrx;

use std::sync::Arc;
use crate::node::{DeviceClient, NodeScanner};
use crate::plugmgr::{ModuleClass, ModuleManager};

/// What driver discovery and construction may depend on
#[derive(Clone)]
pub struct DriverContext {
    pub manager: ModuleManager,
    pub scanner: Arc<dyn NodeScanner>,
    pub client: Arc<dyn DeviceClient>,
}

pub struct DriverEntry {
    pub id: &'static str,
    pub discover: fn(&DriverContext) -> anyhow::Result<ModuleClass>,
}

pub static BUILTIN_DRIVERS: &[DriverEntry] = &[
    DriverEntry { id: ppnode::NAME, discover: ppnode::discover },
    DriverEntry { id: lircd::NAME, discover: lircd::discover },
    DriverEntry { id: snapclient::NAME, discover: snapclient::discover },
    DriverEntry { id: rokutv::NAME, discover: rokutv::discover },
    DriverEntry { id: yrx::NAME, discover: yrx::discover },
];

/// Look up `id` in the driver table and run its discovery
pub fn resolve(ctx: &DriverContext, id: &str) -> Option<anyhow::Result<ModuleClass>> {
    BUILTIN_DRIVERS
        .iter()
        .find(|entry| entry.id == id)
        .map(|entry| (entry.discover)(ctx))
}
