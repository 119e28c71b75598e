use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Address family an advertisement was resolved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    Inet,
    Inet6,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Inet => write!(f, "inet"),
            IpProtocol::Inet6 => write!(f, "inet6"),
        }
    }
}

/// A resolved mDNS advertisement.
/// Produced by the watcher once per resolution; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Interface the advertisement was seen on, or "any"
    pub iface: String,

    pub proto: IpProtocol,

    /// Service type without the domain, e.g. "_http._tcp"
    pub kind: String,

    /// Instance name, e.g. "PeriodicPi node [alpha]"
    pub name: String,

    pub address: String,

    pub port: u16,

    /// TXT record key-value pairs, in advertised order
    pub text: Vec<(String, String)>,
}

/// Withdrawal of an advertisement that previously produced a [`ServiceEvent`].
/// Carries no address: removal matching keys off these fields only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemoval {
    pub iface: String,
    pub proto: IpProtocol,
    pub kind: String,
    pub name: String,
}

/// A device discovered through SSDP search replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsdpRecord {
    /// Unique Service Name, the identity of the record
    pub usn: String,

    /// LOCATION header, if the reply carried one
    pub location: Option<String>,

    /// All reply headers, keys upper-cased
    pub headers: BTreeMap<String, String>,

    pub last_seen: DateTime<Utc>,
}
