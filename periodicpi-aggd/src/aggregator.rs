//! Ties discovery to the module manager.
//!
//! mDNS resolutions and removals trigger `ppagg.node_discovered` and
//! `ppagg.node_removed`; SSDP discoveries and evictions trigger
//! `ppagg.ssdp_discovered` and `ppagg.ssdp_removed`. Hooks are dispatched
//! synchronously on the discovery worker that produced the event.

use std::collections::BTreeSet;
use std::sync::Arc;
use mdns_sd::ServiceDaemon;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::protocol::{
    HOOK_NODE_DISCOVERED, HOOK_NODE_REMOVED, HOOK_SSDP_DISCOVERED, HOOK_SSDP_REMOVED,
    METHOD_ADD_SSDP_SEARCH, SSDP_MULTICAST_ADDR, SSDP_MULTICAST_PORT,
};
use shared::types::{ServiceEvent, ServiceRemoval, SsdpRecord};
use crate::config::Config;
use crate::discovery::DiscoveryError;
use crate::drivers::{self, DriverContext};
use crate::mdns::{BrowserEvent, MdnsWatcher};
use crate::node::{DeviceClient, NodeRegistry, NodeScanner};
use crate::plugmgr::{kwargs_port, kwargs_str, Kwargs, ManagerError, ModuleManager};
use crate::rpc::RpcSurface;
use crate::ssdp::{SsdpEvent, SsdpHandle, SsdpPoller};

/// TXT entries travel as `[key, value]` pairs in advertised order
pub fn service_kwargs(event: &ServiceEvent) -> Kwargs {
    let mut args = removal_kwargs(&ServiceRemoval {
        iface: event.iface.clone(),
        proto: event.proto,
        kind: event.kind.clone(),
        name: event.name.clone(),
    });
    args.insert("address".into(), json!(event.address));
    args.insert("port".into(), json!(event.port));
    args.insert("text".into(), json!(event.text));
    args
}

pub fn removal_kwargs(removal: &ServiceRemoval) -> Kwargs {
    let mut args = Kwargs::new();
    args.insert("iface".into(), json!(removal.iface));
    args.insert("proto".into(), json!(removal.proto));
    args.insert("kind".into(), json!(removal.kind));
    args.insert("name".into(), json!(removal.name));
    args
}

/// SSDP events carry the reply headers as they were received, upper-cased
pub fn ssdp_kwargs(record: &SsdpRecord) -> Kwargs {
    let mut args: Kwargs = record
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    args.insert("USN".into(), json!(record.usn));
    if let Some(location) = &record.location {
        args.insert("LOCATION".into(), json!(location));
    }
    args
}

fn trigger(manager: &ModuleManager, hook: &str, args: &Kwargs) {
    match manager.trigger_custom_hook(hook, args) {
        Ok(matched) => tracing::debug!("{} matched {} handler(s)", hook, matched),
        Err(e) => tracing::error!("Could not trigger {}: {}", hook, e),
    }
}

pub fn on_browser_event(manager: &ModuleManager, event: BrowserEvent) {
    match event {
        BrowserEvent::Resolved(event) => {
            tracing::debug!("Advertisement: {} at {}:{}", event.name, event.address, event.port);
            trigger(manager, HOOK_NODE_DISCOVERED, &service_kwargs(&event));
        }
        BrowserEvent::Removed(removal) => {
            tracing::debug!("Advertisement withdrawn: {}", removal.name);
            trigger(manager, HOOK_NODE_REMOVED, &removal_kwargs(&removal));
        }
    }
}

pub fn on_ssdp_event(manager: &ModuleManager, event: SsdpEvent) {
    match event {
        SsdpEvent::Discovered(record) => trigger(manager, HOOK_SSDP_DISCOVERED, &ssdp_kwargs(&record)),
        SsdpEvent::Removed(record) => trigger(manager, HOOK_SSDP_REMOVED, &ssdp_kwargs(&record)),
    }
}

pub struct Aggregator {
    config: Config,
    manager: ModuleManager,
    registry: NodeRegistry,
    /// Collects search targets until the poller is started
    ssdp: Arc<Mutex<Option<SsdpPoller>>>,
    mdns_watcher: Option<MdnsWatcher>,
    ssdp_handle: Option<SsdpHandle>,
}

impl Aggregator {
    pub fn new(config: Config) -> Self {
        let manager = ModuleManager::new();
        for hook in [HOOK_NODE_DISCOVERED, HOOK_NODE_REMOVED, HOOK_SSDP_DISCOVERED, HOOK_SSDP_REMOVED] {
            manager.install_custom_hook(hook);
        }

        let registry = NodeRegistry::new();
        registry.install(&manager);

        let ssdp = Arc::new(Mutex::new(Some(SsdpPoller::new(&config.ssdp))));
        let pending = ssdp.clone();
        manager.install_custom_method(METHOD_ADD_SSDP_SEARCH, move |args: &Kwargs| {
            let service_type = kwargs_str(args, "service_type")?;
            let host = args
                .get("host")
                .and_then(Value::as_str)
                .unwrap_or(SSDP_MULTICAST_ADDR);
            let port = match args.get("port") {
                Some(_) => kwargs_port(args, "port")?,
                None => SSDP_MULTICAST_PORT,
            };

            let mut pending = pending.lock();
            let poller = pending.as_mut().ok_or_else(|| {
                ManagerError::NotAvailable("SSDP searches cannot be added once polling started".into())
            })?;
            Ok(json!(poller.add_discovery_type(host, port, service_type)))
        });

        Self {
            config,
            manager,
            registry,
            ssdp,
            mdns_watcher: None,
            ssdp_handle: None,
        }
    }

    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn rpc(&self) -> RpcSurface {
        RpcSurface::new(self.manager.clone(), self.registry.clone())
    }

    /// Run discovery for every driver in the configured manifest
    pub fn discover_drivers(&self, scanner: Arc<dyn NodeScanner>, client: Arc<dyn DeviceClient>) -> usize {
        let mut seen = BTreeSet::new();
        let manifest: Vec<String> = self
            .config
            .modules
            .drivers
            .iter()
            .filter(|id| {
                let fresh = seen.insert(id.as_str());
                if !fresh {
                    tracing::warn!("Driver {} listed twice, ignoring the repeat", id);
                }
                fresh
            })
            .cloned()
            .collect();

        let ctx = DriverContext {
            manager: self.manager.clone(),
            scanner,
            client,
        };
        let found = self
            .manager
            .discover_modules(&manifest, |id| drivers::resolve(&ctx, id));
        tracing::info!("{} of {} driver(s) available", found, manifest.len());
        found
    }

    pub fn start_mdns(&mut self, daemon: &ServiceDaemon) -> Result<(), DiscoveryError> {
        let manager = self.manager.clone();
        let watcher = MdnsWatcher::start(
            daemon,
            self.config.mdns.interface.as_deref(),
            &self.config.mdns.service_types,
            move |event| on_browser_event(&manager, event),
        )?;
        self.mdns_watcher = Some(watcher);
        Ok(())
    }

    fn take_poller(&self) -> Option<SsdpPoller> {
        self.ssdp.lock().take()
    }

    /// Start polling the searches registered so far. Without any the poller
    /// is not started at all.
    pub fn start_ssdp(&mut self) -> Result<(), DiscoveryError> {
        let Some(poller) = self.take_poller() else {
            return Ok(());
        };
        if poller.targets().is_empty() {
            tracing::info!("No SSDP searches registered, not polling");
            return Ok(());
        }

        let manager = self.manager.clone();
        self.ssdp_handle = Some(poller.start(move |event| on_ssdp_event(&manager, event))?);
        Ok(())
    }

    /// Stop and join both watchers, then unload every module
    pub fn shutdown(&mut self) {
        if let Some(watcher) = &self.mdns_watcher {
            watcher.stop();
        }
        if let Some(handle) = &self.ssdp_handle {
            handle.stop();
        }
        if let Some(watcher) = self.mdns_watcher.take() {
            watcher.join();
        }
        if let Some(handle) = self.ssdp_handle.take() {
            handle.join();
        }

        self.manager.unload_all();
        tracing::info!("All modules unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::METHOD_ADD_ACTIVE_NODE;
    use shared::types::IpProtocol;
    use crate::drivers::testing::RecordingClient;
    use crate::node::{FakeScanner, Node, NodeState};
    use crate::plugmgr::kwargs;

    fn scanner() -> FakeScanner {
        FakeScanner::default()
            .with_node(
                "10.0.0.5",
                json!({"node_element": "alpha", "description": "living room"}),
                json!({"services": [{"service_name": "lircd", "enabled": true, "port": 8765}]}),
            )
            .with_node(
                "10.0.0.6",
                json!({"node_element": "gamma"}),
                json!({"services": []}),
            )
    }

    fn aggregator() -> Aggregator {
        let aggregator = Aggregator::new(Config::default());
        aggregator.discover_drivers(Arc::new(scanner()), Arc::new(RecordingClient::default()));
        aggregator
    }

    fn advert(name: &str, address: &str) -> ServiceEvent {
        ServiceEvent {
            iface: "any".into(),
            proto: IpProtocol::Inet,
            kind: "_http._tcp".into(),
            name: name.into(),
            address: address.into(),
            port: 80,
            text: vec![("path".into(), "/".into())],
        }
    }

    fn withdrawn(name: &str) -> ServiceRemoval {
        ServiceRemoval {
            iface: "any".into(),
            proto: IpProtocol::Inet,
            kind: "_http._tcp".into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_service_kwargs() {
        let args = service_kwargs(&advert("Node [alpha]", "10.0.0.5"));
        assert_eq!(
            Value::Object(args),
            json!({
                "iface": "any", "proto": "inet", "kind": "_http._tcp", "name": "Node [alpha]",
                "address": "10.0.0.5", "port": 80, "text": [["path", "/"]]
            })
        );
    }

    #[test]
    fn test_txt_entries_keep_order_and_duplicates() {
        let mut event = advert("Node [alpha]", "10.0.0.5");
        event.text = vec![
            ("version".into(), "2".into()),
            ("path".into(), "/".into()),
            ("version".into(), "3".into()),
        ];
        assert_eq!(
            service_kwargs(&event)["text"],
            json!([["version", "2"], ["path", "/"], ["version", "3"]])
        );
    }

    #[test]
    fn test_node_advertised_becomes_active() {
        let agg = aggregator();
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("Node [alpha]", "10.0.0.5")));

        let node = agg.registry().get("alpha").unwrap();
        assert_eq!(node.state, NodeState::Active);
        assert_eq!(node.address, "10.0.0.5");
        assert_eq!(node.description["description"], json!("living room"));
        assert_eq!(agg.rpc().list_nodes(true)["alpha"]["state"], json!("active"));
        assert!(agg.manager().is_loaded("lircd"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let agg = aggregator();
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("Node [alpha]", "10.0.0.5")));
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("PeriodicPi node [alpha]", "10.0.0.5")));
        assert_eq!(agg.registry().len(), 1);

        let mut node = Node::new("alpha", "10.0.0.7", 80);
        node.state = NodeState::Active;
        let second = agg
            .manager()
            .call_custom_method(METHOD_ADD_ACTIVE_NODE, &kwargs(json!({"element": "alpha", "node": node})));
        assert!(matches!(second, Err(ManagerError::DuplicateNode(_))));
        assert_eq!(agg.registry().len(), 1);
    }

    #[test]
    fn test_element_mismatch_never_added() {
        let agg = aggregator();
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("Node [beta]", "10.0.0.6")));
        assert!(!agg.registry().contains("beta"));
        assert!(!agg.registry().contains("gamma"));
        assert!(agg.manager().loaded_instances().is_empty());
    }

    #[test]
    fn test_withdrawal_removes_node() {
        let agg = aggregator();
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("Node [alpha]", "10.0.0.5")));
        on_browser_event(agg.manager(), BrowserEvent::Removed(withdrawn("Node [alpha]")));
        assert_eq!(agg.registry().len(), 0);
        assert!(agg.manager().loaded_instances().is_empty());
    }

    #[test]
    fn test_instance_suffixes_never_reused() {
        let agg = aggregator();
        let args = || kwargs(json!({"server_address": "10.0.0.5", "server_port": 8765}));
        let manager = agg.manager();

        assert_eq!(manager.load_module("lircd", args()).unwrap(), "lircd");
        assert_eq!(manager.load_module("lircd", args()).unwrap(), "lircd-1");
        manager.unload_module("lircd").unwrap();
        assert_eq!(manager.load_module("lircd", args()).unwrap(), "lircd-2");
    }

    #[test]
    fn test_ssdp_events_drive_rokutv() {
        let agg = aggregator();
        {
            let pending = agg.ssdp.lock();
            let targets = pending.as_ref().unwrap().targets();
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0].service_type, "roku:ecp");
        }

        let mut record = SsdpRecord {
            usn: "uuid:roku:ecp:X01".into(),
            location: Some("http://10.0.0.40:8060/".into()),
            headers: Default::default(),
            last_seen: chrono::Utc::now(),
        };
        record.headers.insert("ST".into(), "roku:ecp".into());

        on_ssdp_event(agg.manager(), SsdpEvent::Discovered(record.clone()));
        assert!(agg.manager().is_loaded("rokutv"));
        on_ssdp_event(agg.manager(), SsdpEvent::Removed(record));
        assert!(!agg.manager().is_loaded("rokutv"));
    }

    #[test]
    fn test_searches_closed_once_polling_starts() {
        let agg = aggregator();
        let search = kwargs(json!({"service_type": "urn:schemas-upnp-org:device:MediaRenderer:1"}));
        assert_eq!(agg.manager().call_custom_method(METHOD_ADD_SSDP_SEARCH, &search).unwrap(), json!(true));
        assert_eq!(agg.manager().call_custom_method(METHOD_ADD_SSDP_SEARCH, &search).unwrap(), json!(false));

        assert!(agg.take_poller().is_some());
        assert!(matches!(
            agg.manager().call_custom_method(METHOD_ADD_SSDP_SEARCH, &search),
            Err(ManagerError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_shutdown_unloads_everything() {
        let mut agg = aggregator();
        on_browser_event(agg.manager(), BrowserEvent::Resolved(advert("Node [alpha]", "10.0.0.5")));
        agg.shutdown();
        assert!(agg.manager().loaded_instances().is_empty());
        assert_eq!(agg.registry().len(), 0);
    }
}
