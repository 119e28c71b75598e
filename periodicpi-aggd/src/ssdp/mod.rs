//! SSDP search poller.
//!
//! Repeatedly multicasts `M-SEARCH` requests for a fixed set of search
//! targets and tracks the devices that answer, keyed by USN. A device that
//! stops answering for `interval * removal_units` is reported gone.

mod message;
mod poller;

pub use message::SsdpReply;
pub use poller::{SsdpEvent, SsdpHandle, SsdpPoller, SsdpTarget};
