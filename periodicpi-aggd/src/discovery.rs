use thiserror::Error;

/// Failures inside the discovery workers. These are logged and the worker
/// keeps going; only setup failures reach the caller.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS browse failed: {0}")]
    Browse(#[from] mdns_sd::Error),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("malformed reply: {0}")]
    Malformed(String),
}
