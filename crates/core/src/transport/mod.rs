//! Connection and tunnel interfaces consumed by the session layer.
//!
//! The secure channel to a device is provided by an external client
//! library. This module only fixes the shape the session manager drives:
//!
//! - **Requests** ([`Connection::create_request`]): one request/response
//!   exchange against a resource path on the device (CoAP-style status
//!   codes, binary payload).
//!
//! - **Tunnels** ([`Connection::create_tunnel`]): a local TCP listener that
//!   forwards to a named service on the device.
//!
//! [`direct`] implements both for devices that are reachable directly over
//! TCP, with [`tcp::TcpTunnel`] as a real byte-forwarding tunnel.

pub mod direct;
pub mod tcp;

use std::sync::Arc;
use std::thread;

use crate::error::Result;

pub use direct::{DirectConnection, DirectConnector};
pub use tcp::TcpTunnel;

/// CoAP 2.05 Content, the success status for read requests.
pub const STATUS_CONTENT: u16 = 205;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;

/// Completion callback for the asynchronous tunnel operations.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Response to a device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub payload: Vec<u8>,
}

/// A prepared request. Executing it blocks until the device answers.
pub trait Request: Send {
    fn execute(&self) -> Result<Response>;
}

/// An established connection to one device.
///
/// Shared between every session viewing the same device; sessions never
/// close it.
pub trait Connection: Send + Sync {
    fn create_request(&self, method: &str, path: &str) -> Result<Box<dyn Request>>;

    fn create_tunnel(&self) -> Result<Arc<dyn Tunnel>>;
}

/// A local TCP forwarding endpoint bound to a remote service.
///
/// The blocking forms are required; the completion forms default to running
/// the blocking form on a worker thread.
pub trait Tunnel: Send + Sync + 'static {
    /// Bind a local port (0 = ephemeral) forwarding to `service`.
    fn open(&self, service: &str, local_port: u16) -> Result<()>;

    /// The local port assigned at open time.
    fn local_port(&self) -> Result<u16>;

    fn close(&self) -> Result<()>;

    fn open_async(self: Arc<Self>, service: String, local_port: u16, done: Completion) {
        thread::spawn(move || done(self.open(&service, local_port)));
    }

    fn close_async(self: Arc<Self>, done: Completion) {
        thread::spawn(move || done(self.close()));
    }
}
