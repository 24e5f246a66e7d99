//! Per-device connection cache and connection lifecycle notifications.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::device::Device;
use crate::error::Result;
use crate::transport::Connection;

const EVENT_CAPACITY: usize = 32;

/// Notifications emitted by a [`ConnectionRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The connection to this device was closed by the transport.
    ConnectionClosed { device_id: String },
    /// The host lost network connectivity.
    NetworkLost,
    /// Network connectivity is back.
    NetworkAvailable,
}

/// Supplies connections to devices.
///
/// A connection is shared by every session for the same device. Sessions
/// never close it; they only remove it after an error so the next
/// [`get_connection`](Self::get_connection) builds a fresh one.
pub trait ConnectionRegistry: Send + Sync {
    fn get_connection(&self, device: &Device) -> Result<Arc<dyn Connection>>;

    fn remove_connection(&self, device: &Device);

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// Builds a new connection to a device. Blocking.
pub trait Connector: Send + Sync {
    fn connect(&self, device: &Device) -> Result<Arc<dyn Connection>>;
}

/// [`ConnectionRegistry`] caching one connection per device id.
///
/// Backed by `parking_lot::RwLock`; connects happen outside the lock, and
/// when two callers race the first inserted connection wins.
#[derive(Clone)]
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    connections: Arc<RwLock<HashMap<String, Arc<dyn Connection>>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cached connection and tell subscribers it is gone.
    pub fn connection_closed(&self, device: &Device) {
        self.connections.write().remove(&device.device_id);
        tracing::info!(device_id = %device.device_id, "connection closed");
        self.emit(RegistryEvent::ConnectionClosed {
            device_id: device.device_id.clone(),
        });
    }

    pub fn network_lost(&self) {
        tracing::info!("network lost");
        self.emit(RegistryEvent::NetworkLost);
    }

    pub fn network_available(&self) {
        tracing::info!("network available");
        self.emit(RegistryEvent::NetworkAvailable);
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl ConnectionRegistry for ConnectionCache {
    fn get_connection(&self, device: &Device) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = self.connections.read().get(&device.device_id) {
            return Ok(conn.clone());
        }

        tracing::debug!(device_id = %device.device_id, "connecting");
        let conn = self.connector.connect(device)?;

        let mut connections = self.connections.write();
        let conn = connections
            .entry(device.device_id.clone())
            .or_insert(conn)
            .clone();
        tracing::info!(device_id = %device.device_id, total = connections.len(), "connection established");
        Ok(conn)
    }

    fn remove_connection(&self, device: &Device) {
        if self.connections.write().remove(&device.device_id).is_some() {
            tracing::debug!(device_id = %device.device_id, "connection removed");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
