//! Error types for the edge video session library.

use std::fmt;

use crate::backend::BackendErrorCode;

/// Errors that can occur while reaching a device and streaming from it.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Reachability**: [`NoChannels`](Self::NoChannels),
///   [`Timeout`](Self::Timeout), [`Stopped`](Self::Stopped).
/// - **Device protocol**: [`UnexpectedStatus`](Self::UnexpectedStatus),
///   [`Decode`](Self::Decode).
/// - **Tunnel**: [`Tunnel`](Self::Tunnel).
/// - **Playback**: [`Playback`](Self::Playback).
///
/// Every variant classifies into exactly one [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    /// The device could not be reached on any network path.
    #[error("no channels available to reach the device")]
    NoChannels,

    /// An operation exceeded the transport deadline.
    #[error("operation timed out")]
    Timeout,

    /// The local transport is shutting down; a restart is already pending.
    #[error("client stopped")]
    Stopped,

    /// The device answered a request with something other than the success status.
    #[error("unexpected status {status} for {path}")]
    UnexpectedStatus { path: String, status: u16 },

    /// The device answered with a payload that could not be decoded.
    #[error("could not decode service descriptor: {0}")]
    Decode(String),

    /// Opening, querying or closing a tunnel failed.
    #[error("tunnel error: {kind}")]
    Tunnel { kind: TunnelErrorKind },

    /// The video backend reported an error.
    #[error("playback error ({code:?}): {message}")]
    Playback {
        code: BackendErrorCode,
        message: String,
    },

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else, rendered with its raw description.
    #[error("{0}")]
    Other(String),
}

/// Specific kind of tunnel failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelErrorKind {
    /// The handle was never opened or has been closed.
    NotOpen,
    /// `open` was called on a tunnel that is already forwarding.
    AlreadyOpen,
    /// The device does not expose a service with this name.
    UnknownService(String),
    /// The local listener could not be set up.
    OpenFailed(String),
    /// The transport refused to close the tunnel.
    CloseFailed(String),
}

impl fmt::Display for TunnelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "tunnel is not open"),
            Self::AlreadyOpen => write!(f, "tunnel is already open"),
            Self::UnknownService(name) => write!(f, "unknown service '{name}'"),
            Self::OpenFailed(detail) => write!(f, "open failed: {detail}"),
            Self::CloseFailed(detail) => write!(f, "close failed: {detail}"),
        }
    }
}

/// Classification used to decide what the user gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoChannels,
    Timeout,
    Stopped,
    RemoteProtocolError,
    TunnelError,
    Generic,
}

impl EdgeError {
    pub(crate) fn tunnel(kind: TunnelErrorKind) -> Self {
        Self::Tunnel { kind }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoChannels => ErrorKind::NoChannels,
            Self::Timeout => ErrorKind::Timeout,
            Self::Stopped => ErrorKind::Stopped,
            Self::UnexpectedStatus { .. } | Self::Decode(_) => ErrorKind::RemoteProtocolError,
            Self::Tunnel { .. } => ErrorKind::TunnelError,
            Self::Playback { .. } | Self::Io(_) | Self::Other(_) => ErrorKind::Generic,
        }
    }

    /// Banner text for this error, or `None` when nothing should be shown.
    ///
    /// [`Stopped`](Self::Stopped) is silent: the transport is restarting and
    /// the next connect attempt will rebuild it.
    pub fn user_message(&self) -> Option<String> {
        match self.kind() {
            ErrorKind::NoChannels => Some(
                "Device offline - please make sure you and the target device both have a working network connection"
                    .to_string(),
            ),
            ErrorKind::Timeout => {
                Some("The operation timed out - was the connection lost?".to_string())
            }
            ErrorKind::Stopped => None,
            _ => Some(format!("An error occurred: {self}")),
        }
    }
}

/// Convenience alias for `Result<T, EdgeError>`.
pub type Result<T> = std::result::Result<T, EdgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_protocol_errors() {
        let status = EdgeError::UnexpectedStatus {
            path: "/tcp-tunnels/services/rtsp".to_string(),
            status: 404,
        };
        assert_eq!(status.kind(), ErrorKind::RemoteProtocolError);
        assert_eq!(
            EdgeError::Decode("eof".into()).kind(),
            ErrorKind::RemoteProtocolError
        );
    }

    #[test]
    fn stopped_is_silent() {
        assert_eq!(EdgeError::Stopped.kind(), ErrorKind::Stopped);
        assert!(EdgeError::Stopped.user_message().is_none());
    }

    #[test]
    fn generic_message_carries_description() {
        let err = EdgeError::Other("boom".to_string());
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.user_message().as_deref(), Some("An error occurred: boom"));
    }

    #[test]
    fn tunnel_kind_display() {
        let err = EdgeError::tunnel(TunnelErrorKind::UnknownService("rtsp".into()));
        assert_eq!(err.kind(), ErrorKind::TunnelError);
        assert_eq!(err.to_string(), "tunnel error: unknown service 'rtsp'");
    }

    #[test]
    fn offline_and_timeout_messages() {
        assert!(
            EdgeError::NoChannels
                .user_message()
                .unwrap()
                .starts_with("Device offline")
        );
        assert!(
            EdgeError::Timeout
                .user_message()
                .unwrap()
                .contains("timed out")
        );
    }
}
