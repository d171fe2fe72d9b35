//! # Shellmux Daemon Library
//!
//! This crate runs shell commands as long-lived sessions and shares each
//! session with any number of WebSocket clients.
//!
//! ## Overview
//!
//! - **Sessions**: Each session owns one child process in its own process
//!   group, with stdout and stderr merged into a single output stream
//! - **Fan-out**: Output is kept in a bounded history and replayed to late
//!   joiners before live output
//! - **Registry**: Sessions are shared by id and reaped once the process has
//!   exited and the last client has left
//! - **Gateway**: One WebSocket connection serves one client attached to one
//!   session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ Gateway Server ── one task per WebSocket connection       │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ Session Registry                                          │  │
//! │  │   Session ── output broadcaster ── history                │  │
//! │  │      └── process launcher (sh -c, own process group)      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Accepting connections until stopped.
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Process launching, sessions and the registry
//! - [`gateway`]: WebSocket listener and per-connection state machine
//! - [`client`]: WebSocket client used by the CLI and tests
//! - [`orchestrator`]: Main daemon coordinator

pub mod client;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod session;

pub use protocol;

pub use client::{ClientError, GatewayClient};
pub use config::{Config, ConfigError};
pub use gateway::{ConnectionState, GatewayConnection, GatewayError, GatewayServer};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{
    AttachKind, ClientHandle, CreateRequest, Geometry, LaunchError, ProcessLauncher, Session,
    SessionError, SessionId, SessionOptions, SessionRegistry, SessionState,
};
