//! Device-facing TCP server.

pub mod codec;
pub mod listener;
pub mod registry;
pub mod session;

pub use listener::{Server, ServerConfig};
pub use registry::{CommandError, DeviceInfo, SessionRegistry};
pub use session::SessionConfig;
