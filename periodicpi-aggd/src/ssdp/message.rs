use std::collections::BTreeMap;
use once_cell::sync::Lazy;
use regex::Regex;
use crate::discovery::DiscoveryError;

static STATUS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^HTTP/([0-9.]+) ([0-9]+)").expect("valid regex"));

static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s]+):\s*(.*)$").expect("valid regex"));

/// A parsed search reply with upper-cased header names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpReply {
    pub version: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

impl SsdpReply {
    pub fn usn(&self) -> Option<&str> {
        self.headers.get("USN").map(String::as_str)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("LOCATION").map(String::as_str)
    }
}

pub fn build_search_request(host: &str, port: u16, service_type: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {}:{}\r\nMAN: \"ssdp:discover\"\r\nMX: 3\r\nST: {}\r\n\r\n",
        host, port, service_type
    )
}

/// Parse a search reply. Header lines that do not look like `Key: value`
/// are skipped; a bad status line or a missing USN rejects the reply.
pub fn parse_response(raw: &str) -> Result<SsdpReply, DiscoveryError> {
    let mut lines = raw.lines();

    let status_line = lines.next().unwrap_or_default();
    let captures = STATUS_LINE
        .captures(status_line)
        .ok_or_else(|| DiscoveryError::Malformed(format!("bad status line {:?}", status_line)))?;
    let version = captures[1].to_string();
    let status = captures[2]
        .parse()
        .map_err(|_| DiscoveryError::Malformed(format!("bad status code {:?}", &captures[2])))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match HEADER_LINE.captures(line) {
            Some(c) => {
                headers.insert(c[1].to_ascii_uppercase(), c[2].trim_end().to_string());
            }
            None => tracing::debug!("Skipping malformed SSDP header line {:?}", line),
        }
    }

    if !headers.contains_key("USN") {
        return Err(DiscoveryError::Malformed("reply carries no USN".to_string()));
    }

    Ok(SsdpReply {
        version,
        status,
        headers,
    })
}
