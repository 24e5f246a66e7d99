//! In-process transport for devices reachable directly over TCP.
//!
//! The "device" is described by the service descriptors it would advertise.
//! Descriptor requests are answered locally with the same CBOR payload a
//! device would send, and tunnels are [`TcpTunnel`]s forwarding to each
//! service's `Host:Port`.

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::descriptor::{SERVICES_PATH, ServiceDescriptor};
use crate::device::Device;
use crate::error::{EdgeError, Result};
use crate::registry::Connector;
use crate::transport::{
    Connection, Request, Response, STATUS_CONTENT, STATUS_METHOD_NOT_ALLOWED, STATUS_NOT_FOUND,
    TcpTunnel, Tunnel,
};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A connection to a directly reachable device.
#[derive(Clone)]
pub struct DirectConnection {
    services: Arc<HashMap<String, ServiceDescriptor>>,
}

impl DirectConnection {
    pub fn new(services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        Self {
            services: Arc::new(services.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }
}

impl Connection for DirectConnection {
    fn create_request(&self, method: &str, path: &str) -> Result<Box<dyn Request>> {
        Ok(Box::new(DirectRequest {
            services: self.services.clone(),
            method: method.to_string(),
            path: path.to_string(),
        }))
    }

    fn create_tunnel(&self) -> Result<Arc<dyn Tunnel>> {
        let targets = self
            .services
            .iter()
            .map(|(id, s)| (id.clone(), s.target_addr()))
            .collect();
        Ok(Arc::new(TcpTunnel::new(targets)))
    }
}

struct DirectRequest {
    services: Arc<HashMap<String, ServiceDescriptor>>,
    method: String,
    path: String,
}

impl Request for DirectRequest {
    fn execute(&self) -> Result<Response> {
        if self.method != "GET" {
            return Ok(Response {
                status: STATUS_METHOD_NOT_ALLOWED,
                payload: Vec::new(),
            });
        }

        let service = self
            .path
            .strip_prefix(SERVICES_PATH)
            .and_then(|id| self.services.get(id));

        match service {
            Some(descriptor) => Ok(Response {
                status: STATUS_CONTENT,
                payload: descriptor.encode()?,
            }),
            None => Ok(Response {
                status: STATUS_NOT_FOUND,
                payload: Vec::new(),
            }),
        }
    }
}

/// [`Connector`] for devices registered with their service descriptors.
///
/// Connecting probes the first service with a TCP connect so an unreachable
/// device fails the way a remote one would: refused or unroutable is
/// [`EdgeError::NoChannels`], a probe timeout is [`EdgeError::Timeout`].
pub struct DirectConnector {
    devices: RwLock<HashMap<String, Vec<ServiceDescriptor>>>,
    probe_timeout: Duration,
}

impl DirectConnector {
    pub fn new() -> Self {
        Self::with_probe_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(probe_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            probe_timeout,
        }
    }

    /// Register (or replace) the services a device exposes.
    pub fn add_device(&self, device_id: &str, services: Vec<ServiceDescriptor>) {
        tracing::debug!(device_id, services = services.len(), "direct device registered");
        self.devices.write().insert(device_id.to_string(), services);
    }

    fn probe(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let addrs = descriptor
            .target_addr()
            .to_socket_addrs()
            .map_err(|_| EdgeError::NoChannels)?;

        let mut failure = EdgeError::NoChannels;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.probe_timeout) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => failure = EdgeError::Timeout,
                Err(e) => tracing::debug!(%addr, error = %e, "probe failed"),
            }
        }
        Err(failure)
    }
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for DirectConnector {
    fn connect(&self, device: &Device) -> Result<Arc<dyn Connection>> {
        let services = self
            .devices
            .read()
            .get(&device.device_id)
            .cloned()
            .ok_or(EdgeError::NoChannels)?;

        if let Some(first) = services.first() {
            self.probe(first)?;
        }

        Ok(Arc::new(DirectConnection::new(services)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{fetch_service_descriptor, service_path};
    use std::net::TcpListener;

    fn camera(port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new("rtsp", "rtsp", "127.0.0.1", port).with_metadata("rtsp-path", "/live")
    }

    #[test]
    fn serves_descriptor() {
        let conn = DirectConnection::new([camera(8554)]);
        let descriptor = fetch_service_descriptor(&conn, "rtsp").unwrap();
        assert_eq!(descriptor, camera(8554));
    }

    #[test]
    fn unknown_service_is_not_found() {
        let conn = DirectConnection::new([camera(8554)]);
        let response = conn
            .create_request("GET", &service_path("http"))
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(response.status, STATUS_NOT_FOUND);
    }

    #[test]
    fn only_get_is_allowed() {
        let conn = DirectConnection::new([camera(8554)]);
        let response = conn
            .create_request("POST", &service_path("rtsp"))
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(response.status, STATUS_METHOD_NOT_ALLOWED);
    }

    #[test]
    fn unknown_device_has_no_channels() {
        let connector = DirectConnector::new();
        let device = Device::new("pr-1", "de-1", "cam");
        assert!(matches!(
            connector.connect(&device),
            Err(EdgeError::NoChannels)
        ));
    }

    #[test]
    fn connects_to_listening_device() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = DirectConnector::new();
        connector.add_device("de-1", vec![camera(port)]);
        let device = Device::new("pr-1", "de-1", "cam");
        assert!(connector.connect(&device).is_ok());
    }

    #[test]
    fn refused_device_has_no_channels() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = DirectConnector::new();
        connector.add_device("de-1", vec![camera(port)]);
        let device = Device::new("pr-1", "de-1", "cam");
        assert!(matches!(
            connector.connect(&device),
            Err(EdgeError::NoChannels)
        ));
    }
}
