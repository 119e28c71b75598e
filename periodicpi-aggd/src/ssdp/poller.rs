use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use chrono::{DateTime, Utc};
use shared::types::SsdpRecord;
use crate::config::SsdpConfig;
use crate::discovery::DiscoveryError;
use super::message::{build_search_request, parse_response, SsdpReply};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpTarget {
    pub host: String,
    pub port: u16,
    /// Search target sent in the `ST` header
    pub service_type: String,
}

#[derive(Debug, Clone)]
pub enum SsdpEvent {
    Discovered(SsdpRecord),
    Removed(SsdpRecord),
}

/// Devices seen so far, keyed by USN.
#[derive(Default)]
pub struct KnownServices {
    records: BTreeMap<String, SsdpRecord>,
}

impl KnownServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reply. Returns the new record the first time a USN is seen;
    /// later replies only refresh `last_seen`.
    pub fn observe(&mut self, reply: SsdpReply, now: DateTime<Utc>) -> Option<&SsdpRecord> {
        let usn = reply.usn()?.to_string();

        if let Some(known) = self.records.get_mut(&usn) {
            known.last_seen = now;
            return None;
        }

        let record = SsdpRecord {
            usn: usn.clone(),
            location: reply.location().map(str::to_string),
            headers: reply.headers,
            last_seen: now,
        };
        Some(&*self.records.entry(usn).or_insert(record))
    }

    /// Evict every record not refreshed within `max_age`, handing each one to
    /// `on_removed` before it is dropped. Returns the number evicted.
    pub fn sweep<F>(&mut self, now: DateTime<Utc>, max_age: Duration, mut on_removed: F) -> usize
    where
        F: FnMut(&SsdpRecord),
    {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| {
                now.signed_duration_since(record.last_seen)
                    .to_std()
                    .map_or(false, |age| age > max_age)
            })
            .map(|record| record.usn.clone())
            .collect();

        for usn in &expired {
            if let Some(record) = self.records.get(usn) {
                on_removed(record);
            }
            self.records.remove(usn);
        }
        expired.len()
    }

    pub fn contains(&self, usn: &str) -> bool {
        self.records.contains_key(usn)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Send one search request and wait up to `timeout` for a single reply.
/// A timeout is not an error; it just means nothing answered.
pub fn probe(target: &SsdpTarget, timeout: Duration) -> Result<Option<SsdpReply>, DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_read_timeout(Some(timeout))?;

    let request = build_search_request(&target.host, target.port, &target.service_type);
    socket.send_to(request.as_bytes(), (target.host.as_str(), target.port))?;

    let mut buf = [0u8; 2048];
    let (len, from) = match socket.recv_from(&mut buf) {
        Ok(received) => received,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match parse_response(&String::from_utf8_lossy(&buf[..len])) {
        Ok(reply) => Ok(Some(reply)),
        Err(e) => {
            tracing::debug!("Discarding SSDP reply from {}: {}", from, e);
            Ok(None)
        }
    }
}

fn poll_once<F>(
    targets: &[SsdpTarget],
    known: &mut KnownServices,
    probe_timeout: Duration,
    max_age: Duration,
    callback: &mut F,
) where
    F: FnMut(SsdpEvent),
{
    for target in targets {
        match probe(target, probe_timeout) {
            Ok(Some(reply)) => {
                if let Some(record) = known.observe(reply, Utc::now()) {
                    tracing::info!("SSDP device found: {}", record.usn);
                    let record = record.clone();
                    callback(SsdpEvent::Discovered(record));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("SSDP probe for {} failed: {}", target.service_type, e),
        }
    }

    known.sweep(Utc::now(), max_age, |record| {
        tracing::info!("SSDP device gone: {}", record.usn);
        callback(SsdpEvent::Removed(record.clone()));
    });
}

/// Search targets collected before the poller starts.
pub struct SsdpPoller {
    config: SsdpConfig,
    targets: Vec<SsdpTarget>,
}

impl SsdpPoller {
    pub fn new(config: &SsdpConfig) -> Self {
        Self {
            config: config.clone(),
            targets: Vec::new(),
        }
    }

    /// Returns false if the target was already registered
    pub fn add_discovery_type(&mut self, host: &str, port: u16, service_type: &str) -> bool {
        let target = SsdpTarget {
            host: host.to_string(),
            port,
            service_type: service_type.to_string(),
        };
        if self.targets.contains(&target) {
            return false;
        }
        tracing::debug!("Added SSDP search {} at {}:{}", service_type, host, port);
        self.targets.push(target);
        true
    }

    pub fn remove_discovery_type(&mut self, host: &str, port: u16, service_type: &str) -> bool {
        let before = self.targets.len();
        self.targets
            .retain(|t| !(t.host == host && t.port == port && t.service_type == service_type));
        self.targets.len() != before
    }

    pub fn targets(&self) -> &[SsdpTarget] {
        &self.targets
    }

    pub fn start<F>(self, mut callback: F) -> Result<SsdpHandle, DiscoveryError>
    where
        F: FnMut(SsdpEvent) + Send + 'static,
    {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let interval = self.config.interval();
        let probe_timeout = self.config.probe_timeout();
        let max_age = self.config.max_age();
        let targets = self.targets;

        tracing::info!("Starting SSDP poller with {} search target(s)", targets.len());

        let thread = thread::Builder::new()
            .name("ssdp-poller".to_string())
            .spawn(move || {
                let mut known = KnownServices::new();
                loop {
                    poll_once(&targets, &mut known, probe_timeout, max_age, &mut callback);

                    match stop_rx.recv_timeout(interval) {
                        Err(flume::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::info!("SSDP poller stopped");
            })?;

        Ok(SsdpHandle { stop_tx, thread })
    }
}

pub struct SsdpHandle {
    stop_tx: flume::Sender<()>,
    thread: JoinHandle<()>,
}

impl SsdpHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("SSDP poller thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const REPLY: &str = "HTTP/1.1 200 OK\r\nST: roku:ecp\r\nLOCATION: http://10.0.0.40:8060/\r\nUSN: uuid:roku:ecp:X01\r\n\r\n";

    fn reply(usn: &str) -> SsdpReply {
        parse_response(&format!("HTTP/1.1 200 OK\r\nUSN: {}\r\n\r\n", usn)).unwrap()
    }

    /// Loopback socket answering `replies` search requests with `REPLY`
    fn fake_device(replies: usize) -> (SsdpTarget, JoinHandle<Vec<String>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let device = thread::spawn(move || {
            let mut requests = Vec::new();
            let mut buf = [0u8; 2048];
            for _ in 0..replies {
                let (len, from) = socket.recv_from(&mut buf).unwrap();
                requests.push(String::from_utf8_lossy(&buf[..len]).to_string());
                socket.send_to(REPLY.as_bytes(), from).unwrap();
            }
            requests
        });
        let target = SsdpTarget {
            host: "127.0.0.1".to_string(),
            port,
            service_type: "roku:ecp".to_string(),
        };
        (target, device)
    }

    #[test]
    fn test_known_usn_only_refreshes() {
        let mut known = KnownServices::new();
        let t0 = Utc::now();

        assert!(known.observe(reply("uuid:a"), t0).is_some());
        let later = t0 + chrono::Duration::seconds(5);
        assert!(known.observe(reply("uuid:a"), later).is_none());
        assert_eq!(known.len(), 1);
        assert_eq!(known.records["uuid:a"].last_seen, later);
    }

    #[test]
    fn test_sweep_evicts_stale_records_once() {
        let mut known = KnownServices::new();
        let t0 = Utc::now();
        known.observe(reply("uuid:a"), t0);
        known.observe(reply("uuid:b"), t0 + chrono::Duration::seconds(20));

        let max_age = Duration::from_secs(30);
        let mut removed = Vec::new();

        // exactly at the limit is still fresh
        let at_limit = t0 + chrono::Duration::seconds(30);
        assert_eq!(known.sweep(at_limit, max_age, |r| removed.push(r.usn.clone())), 0);

        let past = t0 + chrono::Duration::seconds(31);
        assert_eq!(known.sweep(past, max_age, |r| removed.push(r.usn.clone())), 1);
        assert_eq!(known.sweep(past, max_age, |r| removed.push(r.usn.clone())), 0);
        assert_eq!(removed, vec!["uuid:a"]);
        assert!(known.contains("uuid:b"));
    }

    #[test]
    fn test_targets_before_start() {
        let mut poller = SsdpPoller::new(&SsdpConfig::default());
        assert!(poller.add_discovery_type("239.255.255.250", 1900, "roku:ecp"));
        assert!(!poller.add_discovery_type("239.255.255.250", 1900, "roku:ecp"));
        assert!(poller.add_discovery_type("239.255.255.250", 1900, "urn:dial-multiscreen-org:service:dial:1"));
        assert!(poller.remove_discovery_type("239.255.255.250", 1900, "roku:ecp"));
        assert!(!poller.remove_discovery_type("239.255.255.250", 1900, "roku:ecp"));
        assert_eq!(poller.targets().len(), 1);
    }

    #[test]
    fn test_probe_loopback_device() {
        let (target, device) = fake_device(1);
        let reply = probe(&target, Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply.usn(), Some("uuid:roku:ecp:X01"));

        let requests = device.join().unwrap();
        assert!(requests[0].starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(requests[0].contains("\r\nST: roku:ecp\r\n"));
    }

    #[test]
    fn test_probe_timeout_finds_nothing() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = SsdpTarget {
            host: "127.0.0.1".to_string(),
            port: silent.local_addr().unwrap().port(),
            service_type: "roku:ecp".to_string(),
        };
        assert!(probe(&target, Duration::from_millis(100)).unwrap().is_none());
    }

    #[test]
    fn test_poll_reports_device_once() {
        let (target, device) = fake_device(2);
        let mut known = KnownServices::new();
        let mut events = Vec::new();
        let mut record = |e: SsdpEvent| events.push(e);

        let timeout = Duration::from_secs(2);
        let max_age = Duration::from_secs(60);
        poll_once(&[target.clone()], &mut known, timeout, max_age, &mut record);
        poll_once(&[target], &mut known, timeout, max_age, &mut record);
        device.join().unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            SsdpEvent::Discovered(r) => {
                assert_eq!(r.usn, "uuid:roku:ecp:X01");
                assert_eq!(r.location.as_deref(), Some("http://10.0.0.40:8060/"));
                assert_eq!(r.headers["ST"], "roku:ecp");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_running_poller_discovers_and_stops() {
        let (target, _device) = fake_device(1);
        let config = SsdpConfig {
            interval_secs: 60,
            removal_units: 3,
            probe_timeout_secs: 2,
        };
        let mut poller = SsdpPoller::new(&config);
        poller.add_discovery_type(&target.host, target.port, &target.service_type);

        let (tx, rx) = flume::unbounded();
        let handle = poller.start(move |event| {
            let _ = tx.send(event);
        }).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SsdpEvent::Discovered(r) if r.usn == "uuid:roku:ecp:X01"));

        // the 60s inter-tick wait must not delay shutdown
        let started = Instant::now();
        handle.stop();
        handle.join();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
