use std::time::Duration;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::runtime::Handle;
use shared::protocol::{NODE_ELEMENT_KEY, NODE_INFO_PATH, NODE_SERVICES_PATH};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("could not create HTTP client: {0}")]
    Client(String),

    #[error("error while connecting to node at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("node at {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from node: {0}")]
    Malformed(String),
}

/// One entry of a node's service list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceListing {
    pub service_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Deserialize)]
struct ServiceList {
    services: Vec<ServiceListing>,
}

/// Fetches identity and service documents from a node.
pub trait NodeScanner: Send + Sync {
    fn node_info(&self, address: &str, port: u16) -> Result<Map<String, Value>, ScanError>;

    fn node_services(&self, address: &str, port: u16) -> Result<Vec<ServiceListing>, ScanError>;
}

/// Fire-and-forget control requests to a device's HTTP API.
pub trait DeviceClient: Send + Sync {
    fn post(&self, url: &str) -> Result<(), ScanError>;
}

/// Validate an identity document: a JSON object carrying a string `node_element`
pub fn parse_node_info(body: Value) -> Result<Map<String, Value>, ScanError> {
    let Value::Object(info) = body else {
        return Err(ScanError::Malformed("node info is not an object".into()));
    };
    if !info.get(NODE_ELEMENT_KEY).is_some_and(Value::is_string) {
        return Err(ScanError::Malformed(format!("missing {}", NODE_ELEMENT_KEY)));
    }
    Ok(info)
}

pub fn parse_services(body: Value) -> Result<Vec<ServiceListing>, ScanError> {
    serde_json::from_value::<ServiceList>(body)
        .map(|list| list.services)
        .map_err(|e| ScanError::Malformed(e.to_string()))
}

pub fn node_url(address: &str, port: u16, path: &str) -> String {
    format!("http://{}:{}/{}", address, port, path)
}

/// Scanner over the node's HTTP status endpoints.
///
/// Called from the discovery worker threads, which are not runtime threads,
/// so requests are driven to completion on the captured runtime handle.
pub struct HttpScanner {
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpScanner {
    pub fn new(timeout: Duration, runtime: Handle) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Client(e.to_string()))?;
        Ok(Self { client, runtime })
    }

    fn retrieve_json(&self, address: &str, port: u16, path: &str) -> Result<Value, ScanError> {
        let url = node_url(address, port, path);
        self.runtime.block_on(async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ScanError::Unreachable {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(ScanError::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| ScanError::Malformed(e.to_string()))
        })
    }
}

impl NodeScanner for HttpScanner {
    fn node_info(&self, address: &str, port: u16) -> Result<Map<String, Value>, ScanError> {
        tracing::debug!("Scanning node at {}:{}", address, port);
        parse_node_info(self.retrieve_json(address, port, NODE_INFO_PATH)?)
    }

    fn node_services(&self, address: &str, port: u16) -> Result<Vec<ServiceListing>, ScanError> {
        parse_services(self.retrieve_json(address, port, NODE_SERVICES_PATH)?)
    }
}

impl DeviceClient for HttpScanner {
    fn post(&self, url: &str) -> Result<(), ScanError> {
        self.runtime.block_on(async {
            let response = self
                .client
                .post(url)
                .send()
                .await
                .map_err(|e| ScanError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(ScanError::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_node_info() {
        let info = parse_node_info(json!({"node_element": "alpha", "description": "kitchen"})).unwrap();
        assert_eq!(info["description"], json!("kitchen"));

        assert!(matches!(parse_node_info(json!({"name": "alpha"})), Err(ScanError::Malformed(_))));
        assert!(matches!(parse_node_info(json!({"node_element": 3})), Err(ScanError::Malformed(_))));
        assert!(matches!(parse_node_info(json!(["alpha"])), Err(ScanError::Malformed(_))));
    }

    #[test]
    fn test_parse_services() {
        let services = parse_services(json!({
            "services": [
                {"service_name": "lircd", "enabled": true, "port": 8765},
                {"service_name": "snapclient", "enabled": false}
            ]
        }))
        .unwrap();

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].port, Some(8765));
        assert!(!services[1].enabled);
        assert_eq!(services[1].port, None);

        assert!(parse_services(json!({"services": "none"})).is_err());
        assert!(parse_services(json!({})).is_err());
    }

    #[test]
    fn test_node_url() {
        assert_eq!(node_url("10.0.0.5", 80, NODE_INFO_PATH), "http://10.0.0.5:80/status/node");
    }
}
