use std::fmt;
use std::sync::Arc;

use crate::descriptor::ServiceDescriptor;
use crate::error::{EdgeError, ErrorKind};
use crate::tunnel::TunnelHandle;

/// Session state machine.
///
/// ```text
/// Idle       -> Connecting   (start, refresh, foreground)
/// Connecting -> Streaming    (URI handed to the backend)
/// Connecting -> Error        (any step failed)
/// Error      -> Connecting   (refresh, foreground, network back)
/// *          -> Connecting   (connection closed)
/// *          -> Error        (network lost, no retry until it is back)
/// *          -> Idle         (teardown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Streaming,
    Error,
}

/// Last classified error shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    /// `None` for errors that must stay silent.
    pub fn from_error(err: &EdgeError) -> Option<Self> {
        err.user_message().map(|message| Self {
            kind: err.kind(),
            message,
        })
    }
}

/// Observable session state for the UI.
///
/// `descriptor` and `tunnel` are `None` in `Idle` and `Error`, and `Some` in
/// `Streaming`. During `Connecting` the previous tunnel belongs to the
/// running attempt and is not visible here.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// A connect sequence is in flight.
    pub busy: bool,
    /// Playback paused because the app went to the background.
    pub paused: bool,
    pub buffering: bool,
    pub last_error: Option<SessionError>,
    /// A "reconnected" notice is due once the next attempt succeeds.
    pub reconnect_pending: bool,
    pub descriptor: Option<Arc<ServiceDescriptor>>,
    pub tunnel: Option<TunnelHandle>,
    pub uri: Option<String>,
    /// Path used for the current stream.
    pub effective_path: Option<String>,
    /// Path that applies when the user override is empty.
    pub placeholder_path: String,
    /// Id of the last connect attempt whose result was applied.
    pub attempt: u64,
}

impl SessionSnapshot {
    pub(crate) fn idle(placeholder_path: String) -> Self {
        Self {
            phase: SessionPhase::Idle,
            busy: false,
            paused: false,
            buffering: false,
            last_error: None,
            reconnect_pending: false,
            descriptor: None,
            tunnel: None,
            uri: None,
            effective_path: None,
            placeholder_path,
            attempt: 0,
        }
    }
}

/// One-shot messages for the UI (banners and the busy spinner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Error(SessionError),
    ConnectionClosed,
    NetworkLost,
    NetworkAvailable,
    Reconnected,
    ShowSpinner,
    HideSpinner,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "Communication Error: {}", err.message),
            Self::ConnectionClosed => {
                write!(f, "Connection closed - refresh to try to reconnect")
            }
            Self::NetworkLost => write!(f, "Network connection lost: Please try again later"),
            Self::NetworkAvailable => write!(f, "Network up again!"),
            Self::Reconnected => write!(f, "Connected: Connection re-established!"),
            Self::ShowSpinner => write!(f, "Connecting..."),
            Self::HideSpinner => write!(f, "Connecting done"),
        }
    }
}
