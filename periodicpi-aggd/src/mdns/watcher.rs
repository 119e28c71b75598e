use std::collections::HashMap;
use std::net::IpAddr;
use std::thread::{self, JoinHandle};
use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent, ServiceInfo};
use shared::types::{IpProtocol, ServiceEvent, ServiceRemoval};
use crate::discovery::DiscoveryError;

const LOCAL_DOMAIN: &str = ".local.";

pub enum BrowserEvent {
    Resolved(ServiceEvent),
    Removed(ServiceRemoval),
}

/// `_http._tcp` -> `_http._tcp.local.`
pub fn normalize_service_type(service_type: &str) -> String {
    if service_type.ends_with(LOCAL_DOMAIN) {
        service_type.to_string()
    } else {
        format!("{}{}", service_type.trim_end_matches('.'), LOCAL_DOMAIN)
    }
}

/// Convert a resolved advertisement, keeping only routable IPv4 addresses
pub fn to_service_event(iface: &str, info: &ServiceInfo) -> Option<ServiceEvent> {
    let ty = info.get_type();
    let fullname = info.get_fullname();

    let mut addresses: Vec<_> = info
        .get_addresses()
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(*v4),
            _ => None,
        })
        .collect();
    addresses.sort();

    let Some(address) = addresses.first() else {
        tracing::debug!("Skipping service {} - no usable IPv4 address", fullname);
        return None;
    };

    let Some(name) = fullname.strip_suffix(ty).and_then(|n| n.strip_suffix('.')) else {
        tracing::debug!("Skipping service {} - name does not end in {}", fullname, ty);
        return None;
    };

    let text = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    Some(ServiceEvent {
        iface: iface.to_string(),
        proto: IpProtocol::Inet,
        kind: ty.trim_end_matches(LOCAL_DOMAIN).to_string(),
        name: name.to_string(),
        address: address.to_string(),
        port: info.get_port(),
        text,
    })
}

/// Remembers what was emitted so that removals are only reported for
/// advertisements that produced a discovery event.
struct EmittedSet {
    iface: String,
    emitted: HashMap<String, ServiceRemoval>,
}

impl EmittedSet {
    fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            emitted: HashMap::new(),
        }
    }

    fn handle(&mut self, event: MdnsEvent) -> Option<BrowserEvent> {
        match event {
            MdnsEvent::ServiceFound(ty, fullname) => {
                tracing::debug!("Found {} ({}), resolving", fullname, ty);
                None
            }
            MdnsEvent::ServiceResolved(info) => {
                let event = to_service_event(&self.iface, &info)?;
                tracing::debug!("Resolved service: {} at {}:{}", event.name, event.address, event.port);
                self.emitted.insert(
                    info.get_fullname().to_string(),
                    ServiceRemoval {
                        iface: event.iface.clone(),
                        proto: event.proto,
                        kind: event.kind.clone(),
                        name: event.name.clone(),
                    },
                );
                Some(BrowserEvent::Resolved(event))
            }
            MdnsEvent::ServiceRemoved(_ty, fullname) => match self.emitted.remove(&fullname) {
                Some(removal) => {
                    tracing::debug!("Service removed: {}", fullname);
                    Some(BrowserEvent::Removed(removal))
                }
                None => {
                    tracing::debug!("Ignoring removal of unreported service {}", fullname);
                    None
                }
            },
            _ => None,
        }
    }
}

enum Wake {
    Browse(usize, Result<MdnsEvent, flume::RecvError>),
    Stop,
}

/// Browses the configured service types on a dedicated thread and hands
/// every resolution and removal to a callback.
pub struct MdnsWatcher {
    stop_tx: flume::Sender<()>,
    thread: JoinHandle<()>,
}

impl MdnsWatcher {
    pub fn start<F>(
        daemon: &ServiceDaemon,
        iface: Option<&str>,
        service_types: &[String],
        mut callback: F,
    ) -> Result<Self, DiscoveryError>
    where
        F: FnMut(BrowserEvent) + Send + 'static,
    {
        let mut browses = Vec::new();
        for service_type in service_types {
            let ty = normalize_service_type(service_type);
            let receiver = daemon.browse(&ty)?;
            tracing::info!("Browsing for {}", ty);
            browses.push((ty, receiver));
        }

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let daemon = daemon.clone();
        let mut emitted = EmittedSet::new(iface.unwrap_or("any"));

        let thread = thread::Builder::new()
            .name("mdns-watcher".to_string())
            .spawn(move || {
                let mut receivers: Vec<_> = browses.iter().map(|(_, rx)| rx.clone()).collect();

                loop {
                    let mut selector = flume::Selector::new();
                    for (idx, rx) in receivers.iter().enumerate() {
                        selector = selector.recv(rx, move |event| Wake::Browse(idx, event));
                    }
                    let wake = selector.recv(&stop_rx, |_| Wake::Stop).wait();

                    match wake {
                        Wake::Browse(_, Ok(event)) => {
                            if let Some(event) = emitted.handle(event) {
                                callback(event);
                            }
                        }
                        Wake::Browse(idx, Err(e)) => {
                            tracing::warn!("Browse receiver {} disconnected: {}", idx, e);
                            receivers.remove(idx);
                        }
                        Wake::Stop => break,
                    }
                }

                for (ty, _) in &browses {
                    if let Err(e) = daemon.stop_browse(ty) {
                        tracing::warn!("Failed to stop browsing {}: {}", ty, e);
                    }
                }
                tracing::info!("mDNS watcher stopped");
            })?;

        Ok(Self { stop_tx, thread })
    }

    pub fn stop(&self) {
        // full or disconnected both mean the worker is already on its way out
        let _ = self.stop_tx.try_send(());
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("mDNS watcher thread panicked");
        }
    }
}
