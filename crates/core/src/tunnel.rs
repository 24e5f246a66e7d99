//! Tunnel lifecycle: open, query and close local forwarding endpoints.
//!
//! A [`TunnelHandle`] wraps one transport [`Tunnel`] with an explicit
//! open/closed state so that closing is idempotent and a stale handle can
//! never hand out a port.
//!
//! ```text
//! open / open_async -> Open
//! close / close_detached -> Closed   (no-op when already Closed)
//! ```
//!
//! The controller never closes an old handle on its own; callers close the
//! previous handle before opening the next one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{EdgeError, Result, TunnelErrorKind};
use crate::transport::{Connection, Tunnel};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    Closed,
}

/// One open local-to-remote forwarding binding.
///
/// Cloning shares the binding; closing any clone closes all of them.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    service: String,
    tunnel: Arc<dyn Tunnel>,
    state: Mutex<TunnelState>,
}

impl TunnelHandle {
    fn opened(tunnel: Arc<dyn Tunnel>, service: &str) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst),
                service: service.to_string(),
                tunnel,
                state: Mutex::new(TunnelState::Open),
            }),
        }
    }

    /// Process-unique id, distinct for every opened tunnel.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TunnelState::Open
    }

    /// Local port the tunnel listens on. Fails once the handle is closed.
    pub fn local_port(&self) -> Result<u16> {
        if !self.is_open() {
            return Err(EdgeError::tunnel(TunnelErrorKind::NotOpen));
        }
        self.inner.tunnel.local_port()
    }

    /// Close synchronously. Closing a closed handle is a no-op.
    ///
    /// The handle counts as closed even when the transport reports a
    /// failure; the failure is returned for logging.
    pub fn close(&self) -> Result<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        tracing::debug!(tunnel = self.id(), service = %self.inner.service, "closing tunnel");
        self.inner
            .tunnel
            .close()
            .map_err(|e| EdgeError::tunnel(TunnelErrorKind::CloseFailed(e.to_string())))
    }

    /// Close without waiting. Failures are only logged.
    pub fn close_detached(&self) {
        if !self.mark_closed() {
            return;
        }
        let id = self.id();
        tracing::debug!(tunnel = id, service = %self.inner.service, "closing tunnel in background");
        self.inner.tunnel.clone().close_async(Box::new(move |result| {
            if let Err(e) = result {
                tracing::warn!(tunnel = id, error = %e, "could not close tunnel");
            }
        }));
    }

    /// Returns `true` if this call moved the handle from open to closed.
    fn mark_closed(&self) -> bool {
        let mut state = self.inner.state.lock();
        let was_open = *state == TunnelState::Open;
        *state = TunnelState::Closed;
        was_open
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("state", &self.state())
            .finish()
    }
}

/// Open a tunnel to `service`, blocking until it is bound.
pub fn open(connection: &dyn Connection, service: &str, local_port: u16) -> Result<TunnelHandle> {
    let tunnel = connection.create_tunnel()?;
    tunnel.open(service, local_port)?;
    let handle = TunnelHandle::opened(tunnel, service);
    tracing::info!(tunnel = handle.id(), service, "tunnel opened");
    Ok(handle)
}

/// Open a tunnel and report the handle through `done`.
///
/// `done` runs on the transport's completion thread.
pub fn open_async<F>(connection: &dyn Connection, service: &str, local_port: u16, done: F)
where
    F: FnOnce(Result<TunnelHandle>) + Send + 'static,
{
    let tunnel = match connection.create_tunnel() {
        Ok(tunnel) => tunnel,
        Err(e) => return done(Err(e)),
    };

    let service_name = service.to_string();
    let t = tunnel.clone();
    tunnel.open_async(
        service.to_string(),
        local_port,
        Box::new(move |result| {
            done(result.map(|()| {
                let handle = TunnelHandle::opened(t, &service_name);
                tracing::info!(tunnel = handle.id(), service = %service_name, "tunnel opened");
                handle
            }))
        }),
    );
}

/// Local port of `handle`, failing for a missing or closed handle.
pub fn local_port(handle: Option<&TunnelHandle>) -> Result<u16> {
    handle
        .ok_or(EdgeError::tunnel(TunnelErrorKind::NotOpen))?
        .local_port()
}

/// Close `handle` if there is one. `None` and closed handles are no-ops.
pub fn close(handle: Option<&TunnelHandle>) -> Result<()> {
    match handle {
        Some(handle) => handle.close(),
        None => Ok(()),
    }
}
