//! WebSocket gateway.
//!
//! Accepts WebSocket connections, performs the session handshake, and then
//! relays frames between each connection and the session it is attached to.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Connected ──► Handshaking ──► Attached ──► Closed
//!                    │                          ▲
//!                    └──── rejected handshake ──┘
//! ```
//!
//! The first text frame on a connection must be `new_session` or `connect`.
//! Anything else, or a handshake the registry refuses, earns exactly one
//! `error` frame before the connection is closed. Once attached, `input`,
//! `resize` and `status` frames are dispatched to the session; malformed
//! frames are answered with `error` and the connection carries on.

mod connection;
mod server;

pub use connection::{ConnectionState, GatewayConnection};
pub use server::GatewayServer;

use std::io;
use std::net::SocketAddr;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the gateway itself.
///
/// Per-connection failures are logged and contained; only listener failures
/// reach the caller of [`GatewayServer::run`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listening socket failed while accepting.
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),

    /// A WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
