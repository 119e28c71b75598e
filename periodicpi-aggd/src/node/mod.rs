//! Node lifecycle.
//!
//! A node is created from a matching advertisement, scanned for its identity
//! and service list, gets one driver per recognised service, and becomes
//! active once its gateway driver is attached:
//!
//! `Discovered -> Scanned -> ServicesRegistered -> Active -> Removed`

mod registry;
mod scan;

pub use registry::NodeRegistry;
pub use scan::{DeviceClient, HttpScanner, NodeScanner, ScanError, ServiceListing};
#[cfg(test)]
pub(crate) use scan::fake::FakeScanner;

use std::collections::BTreeMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use shared::protocol::NODE_ELEMENT_KEY;
use crate::plugmgr::{kwargs, Kwargs, ManagerError, ManagerResult, ModuleHandle, ModuleManager};

static NODE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:PeriodicPi )?[Nn]ode \[([a-zA-Z]+)\]").expect("valid regex"));

/// Extract the element id from an advertised instance name such as
/// `PeriodicPi node [alpha]`
pub fn parse_node_element(name: &str) -> Option<&str> {
    NODE_NAME_REGEX
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Discovered,
    Scanned,
    ServicesRegistered,
    Active,
    Removed,
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The node answering at this address is not the one that was advertised
    #[error("node advertised as {advertised} reports element {reported}")]
    ElementMismatch { advertised: String, reported: String },

    #[error("node {element} is {actual:?}, expected {expected:?}")]
    InvalidState {
        element: String,
        expected: NodeState,
        actual: NodeState,
    },

    #[error(transparent)]
    Manager(ManagerError),

    #[error("could not attach driver for service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: ManagerError,
    },
}

/// What a node needs from the manager to attach service drivers.
pub trait DriverLoader {
    fn available_drivers(&self) -> ManagerResult<Vec<String>>;

    fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String>;
}

impl DriverLoader for ModuleHandle {
    fn available_drivers(&self) -> ManagerResult<Vec<String>> {
        ModuleHandle::available_drivers(self)
    }

    fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String> {
        ModuleHandle::load_module(self, name, kwargs)
    }
}

impl DriverLoader for ModuleManager {
    fn available_drivers(&self) -> ManagerResult<Vec<String>> {
        Ok(ModuleManager::available_drivers(self))
    }

    fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String> {
        ModuleManager::load_module(self, name, kwargs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub element: String,
    pub address: String,
    pub port: u16,
    /// Identity document as reported by the node
    #[serde(default)]
    pub description: Map<String, Value>,
    pub state: NodeState,
    /// Advertised service name -> driver instance attached for it
    #[serde(default)]
    pub services: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl Node {
    pub fn new(element: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            element: element.into(),
            address: address.into(),
            port,
            description: Map::new(),
            state: NodeState::Discovered,
            services: BTreeMap::new(),
            gateway: None,
        }
    }

    fn expect_state(&self, expected: NodeState) -> Result<(), NodeError> {
        if self.state != expected {
            return Err(NodeError::InvalidState {
                element: self.element.clone(),
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Fetch the identity document and check it belongs to this element.
    pub fn register_basic_information(&mut self, scanner: &dyn NodeScanner) -> Result<(), NodeError> {
        self.expect_state(NodeState::Discovered)?;

        let info = scanner.node_info(&self.address, self.port)?;
        let reported = info
            .get(NODE_ELEMENT_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if reported != self.element {
            return Err(NodeError::ElementMismatch {
                advertised: self.element.clone(),
                reported: reported.to_string(),
            });
        }

        self.description = info;
        self.state = NodeState::Scanned;
        Ok(())
    }

    /// Fetch the service list and load a driver for every enabled service
    /// that has one.
    ///
    /// Drivers attached before a failure stay recorded in `services` so the
    /// caller can take them down again.
    pub fn register_services(
        &mut self,
        scanner: &dyn NodeScanner,
        loader: &dyn DriverLoader,
    ) -> Result<(), NodeError> {
        self.expect_state(NodeState::Scanned)?;

        let listings = scanner.node_services(&self.address, self.port)?;
        let drivers = loader.available_drivers().map_err(NodeError::Manager)?;

        for listing in listings {
            let name = listing.service_name;
            if !listing.enabled {
                tracing::debug!("{}: service {} is disabled", self.element, name);
                self.services.insert(name, None);
                continue;
            }
            if !drivers.iter().any(|d| *d == name) {
                tracing::info!("{}: no driver available for service {}", self.element, name);
                self.services.insert(name, None);
                continue;
            }

            let args = kwargs(json!({
                "server_address": self.address,
                "server_port": listing.port.unwrap_or(self.port),
                "node_element": self.element,
            }));

            match loader.load_module(&name, args) {
                Ok(id) => {
                    self.services.insert(name, Some(id));
                }
                Err(ManagerError::ModuleAlreadyLoaded(id)) => {
                    tracing::debug!("{}: driver {} already attached", self.element, id);
                    self.services.insert(name, None);
                }
                Err(source) => {
                    return Err(NodeError::Service {
                        service: name,
                        source,
                    });
                }
            }
        }

        self.state = NodeState::ServicesRegistered;
        Ok(())
    }

    pub fn attach_gateway(&mut self, instance: &str) -> Result<(), NodeError> {
        self.expect_state(NodeState::ServicesRegistered)?;
        self.gateway = Some(instance.to_string());
        self.state = NodeState::Active;
        Ok(())
    }

    /// Driver instances attached for this node's services
    pub fn plugin_instances(&self) -> Vec<String> {
        self.services.values().flatten().cloned().collect()
    }

    pub fn summary(&self) -> Value {
        json!({
            "element": self.element,
            "address": self.address,
            "port": self.port,
            "state": self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use serde_json::json;

    struct RecordingLoader {
        drivers: Vec<String>,
        loads: RefCell<Vec<(String, Kwargs)>>,
        already_loaded: Option<&'static str>,
        broken: Option<&'static str>,
    }

    impl RecordingLoader {
        fn new(drivers: &[&str]) -> Self {
            Self {
                drivers: drivers.iter().map(|d| d.to_string()).collect(),
                loads: RefCell::new(Vec::new()),
                already_loaded: None,
                broken: None,
            }
        }
    }

    impl DriverLoader for RecordingLoader {
        fn available_drivers(&self) -> ManagerResult<Vec<String>> {
            Ok(self.drivers.clone())
        }

        fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String> {
            if self.already_loaded == Some(name) {
                return Err(ManagerError::ModuleAlreadyLoaded(name.to_string()));
            }
            if self.broken == Some(name) {
                return Err(ManagerError::load(name, "missing argument: server_port"));
            }
            self.loads.borrow_mut().push((name.to_string(), kwargs));
            Ok(format!("{}-{}", name, self.loads.borrow().len()))
        }
    }

    fn alpha_scanner() -> FakeScanner {
        FakeScanner::default().with_node(
            "10.0.0.5",
            json!({"node_element": "alpha", "location": "kitchen"}),
            json!({"services": [
                {"service_name": "lircd", "enabled": true, "port": 8765},
                {"service_name": "snapclient", "enabled": false, "port": 1704},
                {"service_name": "mpd", "enabled": true, "port": 6600}
            ]}),
        )
    }

    #[test]
    fn test_parse_node_element() {
        assert_eq!(parse_node_element("PeriodicPi node [alpha]"), Some("alpha"));
        assert_eq!(parse_node_element("Node [alpha]"), Some("alpha"));
        assert_eq!(parse_node_element("PeriodicPi node [alpha] #2"), Some("alpha"));
        assert_eq!(parse_node_element("RX-A1020 1234"), None);
        assert_eq!(parse_node_element("Node [a1]"), None);
    }

    #[test]
    fn test_full_lifecycle() {
        let scanner = alpha_scanner();
        let loader = RecordingLoader::new(&["lircd", "snapclient", "ppnode"]);
        let mut node = Node::new("alpha", "10.0.0.5", 80);

        node.register_basic_information(&scanner).unwrap();
        assert_eq!(node.state, NodeState::Scanned);
        assert_eq!(node.description["location"], json!("kitchen"));

        node.register_services(&scanner, &loader).unwrap();
        assert_eq!(node.state, NodeState::ServicesRegistered);

        let loads = loader.loads.borrow();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].0, "lircd");
        assert_eq!(loads[0].1["server_address"], json!("10.0.0.5"));
        assert_eq!(loads[0].1["server_port"], json!(8765));
        assert_eq!(loads[0].1["node_element"], json!("alpha"));

        assert_eq!(node.services["lircd"], Some("lircd-1".to_string()));
        assert_eq!(node.services["snapclient"], None);
        assert_eq!(node.services["mpd"], None);
        assert_eq!(node.plugin_instances(), vec!["lircd-1"]);

        node.attach_gateway("ppnode").unwrap();
        assert_eq!(node.state, NodeState::Active);
        assert_eq!(node.summary()["state"], json!("active"));
    }

    #[test]
    fn test_element_mismatch() {
        let scanner = FakeScanner::default().with_node(
            "10.0.0.6",
            json!({"node_element": "gamma"}),
            json!({"services": []}),
        );
        let mut node = Node::new("beta", "10.0.0.6", 80);

        match node.register_basic_information(&scanner) {
            Err(NodeError::ElementMismatch { advertised, reported }) => {
                assert_eq!(advertised, "beta");
                assert_eq!(reported, "gamma");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(node.state, NodeState::Discovered);
        assert!(node.description.is_empty());
    }

    #[test]
    fn test_unreachable_node_stays_discovered() {
        let mut node = Node::new("alpha", "10.0.0.99", 80);
        assert!(matches!(
            node.register_basic_information(&FakeScanner::default()),
            Err(NodeError::Scan(ScanError::Unreachable { .. }))
        ));
        assert_eq!(node.state, NodeState::Discovered);
    }

    #[test]
    fn test_services_before_scan_rejected() {
        let loader = RecordingLoader::new(&["lircd"]);
        let mut node = Node::new("alpha", "10.0.0.5", 80);
        assert!(matches!(
            node.register_services(&alpha_scanner(), &loader),
            Err(NodeError::InvalidState { expected: NodeState::Scanned, .. })
        ));
        assert!(matches!(
            node.attach_gateway("ppnode"),
            Err(NodeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_already_loaded_is_tolerated() {
        let scanner = alpha_scanner();
        let mut loader = RecordingLoader::new(&["lircd"]);
        loader.already_loaded = Some("lircd");
        let mut node = Node::new("alpha", "10.0.0.5", 80);

        node.register_basic_information(&scanner).unwrap();
        node.register_services(&scanner, &loader).unwrap();
        assert_eq!(node.state, NodeState::ServicesRegistered);
        assert!(node.plugin_instances().is_empty());
    }

    #[test]
    fn test_other_load_failures_propagate() {
        let scanner = alpha_scanner();
        let mut loader = RecordingLoader::new(&["lircd"]);
        loader.broken = Some("lircd");
        let mut node = Node::new("alpha", "10.0.0.5", 80);

        node.register_basic_information(&scanner).unwrap();
        assert!(matches!(
            node.register_services(&scanner, &loader),
            Err(NodeError::Service { service, source: ManagerError::ModuleLoad { .. } }) if service == "lircd"
        ));
        assert_eq!(node.state, NodeState::Scanned);
    }

    #[test]
    fn test_node_serde_roundtrip_keeps_services() {
        let mut node = Node::new("alpha", "10.0.0.5", 80);
        node.services.insert("lircd".into(), Some("lircd".into()));
        let value = serde_json::to_value(&node).unwrap();
        let back: Node = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }
}
