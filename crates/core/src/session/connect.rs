use std::sync::Arc;

use crate::descriptor::{ServiceDescriptor, fetch_service_descriptor};
use crate::device::Device;
use crate::error::Result;
use crate::path::{StreamUri, resolve};
use crate::registry::ConnectionRegistry;
use crate::session::SessionConfig;
use crate::tunnel::{self, TunnelHandle};

/// Everything a Connecting attempt needs, moved onto the worker.
pub(crate) struct ConnectSequence {
    pub(crate) attempt: u64,
    pub(crate) device: Arc<Device>,
    pub(crate) registry: Arc<dyn ConnectionRegistry>,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) user_path: Option<String>,
    /// The session's previous tunnel, closed before the new one is opened.
    pub(crate) previous: Option<TunnelHandle>,
}

/// Result of a successful attempt.
#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) descriptor: ServiceDescriptor,
    pub(crate) path: String,
    pub(crate) uri: String,
}

/// Outcome of one attempt, sent back to the session.
///
/// `tunnel` is whatever tunnel the attempt ends up holding: the new one on
/// success, a partially set up one on failure, or the untouched previous
/// one if the attempt failed before reaching it.
#[derive(Debug)]
pub(crate) struct AttemptReport {
    pub(crate) attempt: u64,
    pub(crate) tunnel: Option<TunnelHandle>,
    pub(crate) result: Result<Established>,
}

impl ConnectSequence {
    /// Run the attempt. Blocking; call from a worker thread.
    pub(crate) fn run(mut self) -> AttemptReport {
        let mut tunnel = self.previous.take();
        let result = self.establish(&mut tunnel);
        AttemptReport {
            attempt: self.attempt,
            tunnel,
            result,
        }
    }

    fn establish(&self, slot: &mut Option<TunnelHandle>) -> Result<Established> {
        let device_id = &self.device.device_id;
        let service = &self.config.service_name;

        let connection = self.registry.get_connection(&self.device)?;
        let descriptor = fetch_service_descriptor(connection.as_ref(), service)?;

        // Reusing the old endpoint gives corrupted first frames; always reopen.
        if let Err(e) = tunnel::close(slot.as_ref()) {
            tracing::warn!(device_id = %device_id, error = %e, "could not close previous tunnel");
        }
        *slot = None;

        let handle = tunnel::open(connection.as_ref(), service, self.config.local_port)?;
        *slot = Some(handle.clone());
        let local_port = handle.local_port()?;

        let path = resolve(
            self.user_path.as_deref(),
            descriptor.rtsp_path(),
            &self.config.default_path,
        );
        let uri = StreamUri::local(local_port, &path)
            .with_host(&self.config.loopback_host)
            .with_credentials(descriptor.rtsp_username(), descriptor.rtsp_password())
            .to_string();

        tracing::debug!(
            device_id = %device_id,
            attempt = self.attempt,
            local_port,
            %path,
            "tunnel ready"
        );

        Ok(Established {
            descriptor,
            path,
            uri,
        })
    }
}
