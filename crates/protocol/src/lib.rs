//! # Shellmux Protocol Library
//!
//! This crate defines the frames exchanged between the Shellmux terminal
//! gateway and its clients.
//!
//! ## Overview
//!
//! A client opens a persistent WebSocket connection and sends exactly one
//! handshake frame: `new_session` to launch a command, or `connect` to join a
//! session that is already running. After the acknowledgement the connection
//! carries `input`, `resize` and `status` frames towards the server and
//! `output`, `input` echoes and `status_response` frames back.
//!
//! ```text
//! client                                   server
//!   │ {"type":"new_session","command":"cat"} │
//!   │ ─────────────────────────────────────▶ │
//!   │ {"type":"session_created",...}         │
//!   │ ◀───────────────────────────────────── │
//!   │ {"type":"input","data":"ping\n"}       │
//!   │ ─────────────────────────────────────▶ │
//!   │ {"type":"input","data":"ping\n",...}   │  echo to every attached client
//!   │ {"type":"output","data":"ping\n",...}  │
//!   │ ◀───────────────────────────────────── │
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Frame, FrameCodec};
//!
//! let codec = FrameCodec::new();
//! let text = codec.encode(&Frame::new_session("htop", 120, 40)).unwrap();
//! assert_eq!(codec.decode(&text).unwrap(), Frame::new_session("htop", 120, 40));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Frame definitions and the status snapshot
//! - [`codec`]: JSON text codec with a size ceiling
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::{ProtocolError, Result};
pub use messages::{
    unix_timestamp, Connect, ErrorMessage, Frame, InputData, NewSession, OutputData, Resize,
    SessionAck, SessionStatus, StatusQuery, StatusReply, DEFAULT_COLS, DEFAULT_ROWS,
};
