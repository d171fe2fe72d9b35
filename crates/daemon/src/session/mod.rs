//! Session management module.
//!
//! This module launches session processes and tracks their lifecycle.
//! Sessions can be created, attached to, detached from, resized, and stopped.

pub mod decode;
pub mod history;
pub mod multiplexer;
pub mod process;
pub mod registry;
pub mod terminal;

pub use history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
pub use multiplexer::{ClientHandle, ClientStats, ConnectionId, SessionOutputBroadcaster};
pub use process::{LaunchError, LaunchSpec, ProcessGroup, ProcessLauncher};
pub use registry::{CreateRequest, RegistrySettings, SessionRegistry, DEFAULT_MAX_SESSIONS};
pub use terminal::{
    AttachKind, Geometry, Session, SessionError, SessionId, SessionOptions, SessionState,
};
