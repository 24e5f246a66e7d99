//! Service descriptors advertised by devices.
//!
//! A device publishes one descriptor per tunnelable service at
//! `/tcp-tunnels/services/<id>`. The payload is a CBOR map:
//!
//! ```text
//! {
//!   "Id": "rtsp",
//!   "Type": "rtsp",
//!   "Host": "127.0.0.1",
//!   "Port": 8554,
//!   "StreamPort": 0,
//!   "Metadata": { "rtsp-path": "/video", "rtsp-username": "..", "rtsp-password": ".." }
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};
use crate::transport::{Connection, STATUS_CONTENT};

pub const SERVICES_PATH: &str = "/tcp-tunnels/services/";

pub const META_RTSP_PATH: &str = "rtsp-path";
pub const META_RTSP_USERNAME: &str = "rtsp-username";
pub const META_RTSP_PASSWORD: &str = "rtsp-password";

/// Resource path of the descriptor for `service`.
pub fn service_path(service: &str) -> String {
    format!("{SERVICES_PATH}{service}")
}

/// Metadata about one service on a device. Replaced wholesale on each fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Type")]
    pub service_type: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "StreamPort")]
    pub stream_port: u16,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(id: &str, service_type: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            service_type: service_type.to_string(),
            host: host.to_string(),
            port,
            stream_port: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(payload).map_err(|e| EdgeError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| EdgeError::Other(e.to_string()))
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn rtsp_path(&self) -> Option<&str> {
        self.meta(META_RTSP_PATH)
    }

    pub fn rtsp_username(&self) -> Option<&str> {
        self.meta(META_RTSP_USERNAME)
    }

    pub fn rtsp_password(&self) -> Option<&str> {
        self.meta(META_RTSP_PASSWORD)
    }

    /// `host:port` of the service as seen from the device.
    pub fn target_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Fetch and decode the descriptor of `service` over `connection`.
///
/// One GET exchange, no retry. Any status other than 2.05 is an
/// [`EdgeError::UnexpectedStatus`]; a bad payload is an [`EdgeError::Decode`].
pub fn fetch_service_descriptor(
    connection: &dyn Connection,
    service: &str,
) -> Result<ServiceDescriptor> {
    let path = service_path(service);
    let response = connection.create_request("GET", &path)?.execute()?;

    if response.status != STATUS_CONTENT {
        tracing::warn!(%path, status = response.status, "service descriptor request failed");
        return Err(EdgeError::UnexpectedStatus {
            path,
            status: response.status,
        });
    }

    let descriptor = ServiceDescriptor::decode(&response.payload)?;
    tracing::debug!(
        service = %descriptor.id,
        host = %descriptor.host,
        port = descriptor.port,
        metadata = descriptor.metadata.len(),
        "service descriptor fetched"
    );
    Ok(descriptor)
}
