use crate::plugmgr::{Module, ModuleCapability, ModuleClass, ModuleDescriptor};
use super::DriverContext;

pub const NAME: &str = "snapclient";

/// Shows a node's SnapCast client in the instance list; has no controls.
struct SnapClient;

impl Module for SnapClient {}

pub fn discover(_ctx: &DriverContext) -> anyhow::Result<ModuleClass> {
    let descriptor = ModuleDescriptor::new(NAME, "SnapCast client dummy driver")
        .capability(ModuleCapability::MultiInstanceAllowed);

    Ok(ModuleClass::new(descriptor, |handle, _args| {
        handle.log_info("SnapCast client attached");
        Ok(Box::new(SnapClient))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing::TestBed;
    use crate::node::FakeScanner;
    use crate::plugmgr::{kwargs, ManagerError};
    use serde_json::json;

    #[test]
    fn test_loads_without_arguments() {
        let bed = TestBed::new(FakeScanner::default());
        bed.discover(&[NAME]);
        let manager = bed.manager();

        assert_eq!(manager.load_module(NAME, kwargs(json!({}))).unwrap(), "snapclient");
        assert_eq!(manager.load_module(NAME, kwargs(json!({}))).unwrap(), "snapclient-1");
        assert!(matches!(
            manager.get_property("snapclient", "volume"),
            Err(ManagerError::NotAvailable(_))
        ));
    }
}
