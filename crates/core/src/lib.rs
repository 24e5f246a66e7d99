pub mod backend;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod path;
pub mod registry;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use backend::{BackendErrorCode, BackendEvent, BackendEvents, VideoBackend};
pub use descriptor::{ServiceDescriptor, fetch_service_descriptor};
pub use device::Device;
pub use error::{EdgeError, ErrorKind, Result};
pub use registry::{ConnectionCache, ConnectionRegistry, Connector, RegistryEvent};
pub use session::{
    Notice, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionManager, SessionPhase,
    SessionSnapshot,
};
pub use tunnel::TunnelHandle;
