//! Frame definitions for the Shellmux terminal protocol.
//!
//! Every message on the wire is one JSON object whose `type` field selects the
//! variant. Wire names are snake_case (`new_session`, `status_response`, ...);
//! the descriptive handshake names (`handshake-new`, `handshake-attach`,
//! `status-query`, ...) are accepted as aliases when decoding.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default terminal width used when a client omits `cols`.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a client omits `rows`.
pub const DEFAULT_ROWS: u16 = 24;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // Handshake (client to server, first frame only)
    /// Request to launch a command in a new session.
    #[serde(alias = "handshake-new")]
    NewSession(NewSession),
    /// Request to join an existing session.
    #[serde(alias = "handshake-attach")]
    Connect(Connect),

    // Handshake acknowledgements (server to client)
    /// A new session was launched and this connection is attached to it.
    #[serde(alias = "session-created")]
    SessionCreated(SessionAck),
    /// This connection joined an existing session.
    Connected(SessionAck),

    // Session traffic
    /// Keystrokes from a client, or the server's echo of accepted input.
    Input(InputData),
    /// A chunk of process output.
    Output(OutputData),
    /// Terminal geometry change request.
    Resize(Resize),
    /// Request for a point-in-time status snapshot.
    #[serde(alias = "status-query")]
    Status(StatusQuery),
    /// Status snapshot reply.
    #[serde(alias = "status-reply")]
    StatusResponse(StatusReply),

    /// Handshake or protocol failure.
    Error(ErrorMessage),
}

impl Frame {
    /// Returns the wire name of this frame's `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::NewSession(_) => "new_session",
            Frame::Connect(_) => "connect",
            Frame::SessionCreated(_) => "session_created",
            Frame::Connected(_) => "connected",
            Frame::Input(_) => "input",
            Frame::Output(_) => "output",
            Frame::Resize(_) => "resize",
            Frame::Status(_) => "status",
            Frame::StatusResponse(_) => "status_response",
            Frame::Error(_) => "error",
        }
    }

    /// Returns true for the two frames that may open a connection.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Frame::NewSession(_) | Frame::Connect(_))
    }

    /// Builds a `new_session` request.
    pub fn new_session(command: impl Into<String>, cols: u16, rows: u16) -> Self {
        Frame::NewSession(NewSession {
            command: command.into(),
            cols,
            rows,
            cwd: None,
        })
    }

    /// Builds a `connect` request.
    pub fn connect(session_id: impl Into<String>) -> Self {
        Frame::Connect(Connect {
            session_id: session_id.into(),
        })
    }

    /// Builds a client-side `input` frame.
    pub fn input(data: impl Into<String>) -> Self {
        Frame::Input(InputData {
            data: data.into(),
            timestamp: None,
            session_id: None,
        })
    }

    /// Builds the server's echo of input accepted by a session.
    pub fn input_echo(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        Frame::Input(InputData {
            data: data.into(),
            timestamp: Some(unix_timestamp()),
            session_id: Some(session_id.into()),
        })
    }

    /// Builds an `output` frame stamped with the current time.
    pub fn output(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        Frame::Output(OutputData {
            data: data.into(),
            timestamp: unix_timestamp(),
            session_id: session_id.into(),
        })
    }

    /// Builds a `resize` request for both dimensions.
    pub fn resize(cols: u16, rows: u16) -> Self {
        Frame::Resize(Resize {
            cols: Some(cols),
            rows: Some(rows),
        })
    }

    /// Builds a `status` query.
    pub fn status_query() -> Self {
        Frame::Status(StatusQuery {})
    }

    /// Builds an `error` frame.
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(ErrorMessage {
            message: message.into(),
        })
    }
}

/// Body of `new_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    /// Shell command line to run.
    pub command: String,
    /// Initial terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Initial terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Working directory; the server default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Body of `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Session to join.
    pub session_id: String,
}

/// Body of `session_created` and `connected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAck {
    /// Session the connection is now attached to.
    pub session_id: String,
    /// Status at the moment of attachment.
    pub status: SessionStatus,
}

/// Body of `input`.
///
/// Clients send only `data`; the server's echo also carries the session and a
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    /// Raw text to feed the process.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Body of `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    /// Decoded process output.
    pub data: String,
    /// Seconds since the Unix epoch when the chunk was read.
    pub timestamp: f64,
    /// Session that produced the chunk.
    pub session_id: String,
}

/// Body of `resize`. A missing dimension keeps its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resize {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// Body of `status`. Carries no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusQuery {}

/// Body of `status_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: SessionStatus,
}

/// Body of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable description.
    pub message: String,
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub command: String,
    /// Seconds since the Unix epoch when the session was created.
    pub start_time: f64,
    /// True while the session is in the running state.
    pub is_active: bool,
    /// True while the launched process has not been reaped.
    pub process_running: bool,
    /// Number of attached connections.
    pub client_count: usize,
    /// Number of output frames held in the history buffer.
    pub buffer_size: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Exit code once the process has exited normally.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SessionStatus {
    /// Seconds elapsed since the session was created.
    pub fn uptime_secs(&self) -> f64 {
        (unix_timestamp() - self.start_time).max(0.0)
    }
}

/// Current time as floating point seconds since the Unix epoch.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_status() -> SessionStatus {
        SessionStatus {
            session_id: "sess-1".to_string(),
            command: "cat".to_string(),
            start_time: 1_700_000_000.5,
            is_active: true,
            process_running: true,
            client_count: 2,
            buffer_size: 7,
            cols: 120,
            rows: 40,
            exit_code: None,
        }
    }

    #[test]
    fn test_new_session_defaults_geometry() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "new_session", "command": "bash"})).unwrap();
        assert_eq!(
            frame,
            Frame::NewSession(NewSession {
                command: "bash".to_string(),
                cols: 80,
                rows: 24,
                cwd: None,
            })
        );
    }

    #[test]
    fn test_handshake_aliases_accepted() {
        let frame: Frame = serde_json::from_value(
            json!({"type": "handshake-new", "command": "ls", "cols": 100, "rows": 30}),
        )
        .unwrap();
        assert!(matches!(frame, Frame::NewSession(ref n) if n.cols == 100 && n.rows == 30));

        let frame: Frame =
            serde_json::from_value(json!({"type": "handshake-attach", "session_id": "abc"}))
                .unwrap();
        assert_eq!(frame, Frame::connect("abc"));

        let frame: Frame = serde_json::from_value(json!({"type": "status-query"})).unwrap();
        assert_eq!(frame, Frame::status_query());
    }

    #[test]
    fn test_status_query_ignores_extra_fields() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "status", "session_id": "ignored"})).unwrap();
        assert_eq!(frame, Frame::status_query());
    }

    #[test]
    fn test_output_wire_shape() {
        let frame = Frame::Output(OutputData {
            data: "hello\n".to_string(),
            timestamp: 12.5,
            session_id: "sess-1".to_string(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "output", "data": "hello\n", "timestamp": 12.5, "session_id": "sess-1"})
        );
    }

    #[test]
    fn test_client_input_omits_server_fields() {
        let value = serde_json::to_value(Frame::input("ping\n")).unwrap();
        assert_eq!(value, json!({"type": "input", "data": "ping\n"}));
    }

    #[test]
    fn test_input_echo_carries_session_and_timestamp() {
        let frame = Frame::input_echo("sess-9", "ls\n");
        match frame {
            Frame::Input(input) => {
                assert_eq!(input.session_id.as_deref(), Some("sess-9"));
                assert!(input.timestamp.unwrap() > 0.0);
            }
            other => panic!("expected input frame, got {:?}", other),
        }
    }

    #[test]
    fn test_resize_partial_fields() {
        let frame: Frame = serde_json::from_value(json!({"type": "resize", "cols": 132})).unwrap();
        assert_eq!(
            frame,
            Frame::Resize(Resize {
                cols: Some(132),
                rows: None
            })
        );
    }

    #[test]
    fn test_status_response_wire_shape() {
        let frame = Frame::StatusResponse(StatusReply {
            status: sample_status(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "status_response");
        assert_eq!(value["status"]["client_count"], 2);
        assert_eq!(value["status"]["buffer_size"], 7);
        assert_eq!(value["status"]["process_running"], true);
        assert!(value["status"]["exit_code"].is_null());
    }

    #[test]
    fn test_status_without_geometry_uses_defaults() {
        let status: SessionStatus = serde_json::from_value(json!({
            "session_id": "s",
            "command": "c",
            "start_time": 1.0,
            "is_active": false,
            "process_running": false,
            "client_count": 0,
            "buffer_size": 0
        }))
        .unwrap();
        assert_eq!((status.cols, status.rows), (80, 24));
        assert_eq!(status.exit_code, None);
    }

    #[test]
    fn test_frame_names_match_wire_tags() {
        let frames = vec![
            Frame::new_session("ls", 80, 24),
            Frame::connect("x"),
            Frame::input("a"),
            Frame::output("x", "b"),
            Frame::resize(1, 2),
            Frame::status_query(),
            Frame::error("boom"),
            Frame::SessionCreated(SessionAck {
                session_id: "x".to_string(),
                status: sample_status(),
            }),
        ];
        for frame in frames {
            let value = serde_json::to_value(&frame).unwrap();
            assert_eq!(value["type"], frame.name());
        }
    }

    #[test]
    fn test_is_handshake() {
        assert!(Frame::new_session("ls", 80, 24).is_handshake());
        assert!(Frame::connect("x").is_handshake());
        assert!(!Frame::input("x").is_handshake());
        assert!(!Frame::status_query().is_handshake());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_value::<Frame>(json!({"type": "launch_missiles"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_uptime_is_non_negative() {
        let mut status = sample_status();
        status.start_time = unix_timestamp() + 1000.0;
        assert_eq!(status.uptime_secs(), 0.0);
    }
}
