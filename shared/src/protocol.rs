/// Hook triggered for every resolved mDNS advertisement
pub const HOOK_NODE_DISCOVERED: &str = "ppagg.node_discovered";
/// Hook triggered when a previously resolved advertisement is withdrawn
pub const HOOK_NODE_REMOVED: &str = "ppagg.node_removed";
/// Hook triggered when an SSDP search reply introduces a new USN
pub const HOOK_SSDP_DISCOVERED: &str = "ppagg.ssdp_discovered";
/// Hook triggered when an SSDP record is evicted
pub const HOOK_SSDP_REMOVED: &str = "ppagg.ssdp_removed";

/// Custom methods installed by the aggregator
pub const METHOD_ADD_ACTIVE_NODE: &str = "ppagg.add_active_node";
pub const METHOD_DEL_ACTIVE_NODE: &str = "ppagg.del_active_node";
pub const METHOD_HAS_ACTIVE_NODE: &str = "ppagg.has_active_node";
pub const METHOD_ADD_SSDP_SEARCH: &str = "ppagg.add_ssdp_search";

/// Node HTTP endpoints
pub const NODE_INFO_PATH: &str = "status/node";
pub const NODE_SERVICES_PATH: &str = "status/services";

/// Identity field every node reports in its info document
pub const NODE_ELEMENT_KEY: &str = "node_element";

/// mDNS service type nodes advertise on
pub const NODE_SERVICE_TYPE: &str = "_http._tcp";

/// Standard SSDP multicast group
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
pub const SSDP_MULTICAST_PORT: u16 = 1900;
