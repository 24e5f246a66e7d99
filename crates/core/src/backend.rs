//! Video backend interface.
//!
//! The session hands the final stream URI to a [`VideoBackend`] and drives
//! it with play/pause/stop. Backends report back through [`BackendEvents`],
//! which feeds the session's event mailbox.

use crate::error::Result;
use crate::session::{Mailbox, Message, SessionEvent};

/// Error codes reported by the video backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorCode {
    /// The stream resource was not found.
    NotFound = 1,
    /// The stream requires credentials that were missing or wrong.
    NotAuthorized = 2,
    /// The error came from outside the resource domain.
    WrongDomain = 3,
    Other = 9999,
}

impl BackendErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::NotFound,
            2 => Self::NotAuthorized,
            3 => Self::WrongDomain,
            _ => Self::Other,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Events a backend reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend finished initializing and accepts commands.
    Initialized,
    Buffering,
    BufferingDone,
    Error {
        code: BackendErrorCode,
        message: String,
    },
}

/// Sender half handed to a backend when it is attached to a session.
#[derive(Clone)]
pub struct BackendEvents {
    mailbox: Mailbox,
}

impl BackendEvents {
    pub(crate) fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }

    /// Deliver `event` to the session. Returns `false` once the session is gone.
    pub fn emit(&self, event: BackendEvent) -> bool {
        self.mailbox
            .send(Message::Event(SessionEvent::Backend(event)))
            .is_ok()
    }
}

/// A video decode/render backend.
pub trait VideoBackend: Send {
    /// Called once when the session takes ownership of the backend.
    fn attach(&mut self, _events: BackendEvents) {}

    fn set_uri(&mut self, uri: &str) -> Result<()>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn stop(&mut self);
}
