//! One gateway connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use protocol::{Frame, FrameCodec, ProtocolError, Resize, StatusReply};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::{
    AttachKind, ClientHandle, ConnectionId, CreateRequest, Session, SessionError,
    SessionRegistry,
};

/// Longest a closing handshake may take once the writer stops.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, nothing received yet.
    Connected,
    /// Waiting for `new_session` or `connect`.
    Handshaking,
    /// Bound to a session.
    Attached,
    /// Finished; no further frames are processed.
    Closed,
}

/// Serves one accepted TCP stream until either side closes it.
pub(super) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    codec: FrameCodec,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let id: ConnectionId = Uuid::new_v4().to_string();
    tracing::info!(connection_id = %id, peer = %peer, "Connection opened");

    let (sink, source) = ws.split();
    let (tx, rx) = mpsc::channel(registry.client_queue_capacity());
    let writer = tokio::spawn(write_loop(sink, rx, codec, id.clone(), shutdown.clone()));

    let mut connection = GatewayConnection::new(id.clone(), registry, codec, tx);
    connection.run(source, shutdown).await;
    // Dropping the connection detaches it, which releases the last sender
    // and lets the writer drain and close.
    drop(connection);

    if let Err(e) = writer.await {
        tracing::error!(connection_id = %id, error = %e, "Writer task failed");
    }
    tracing::info!(connection_id = %id, "Connection closed");
}

/// Drains the outbound queue into the WebSocket.
///
/// Stops at shutdown even if the peer has stopped reading; the closing
/// handshake is bounded by [`CLOSE_TIMEOUT`].
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Frame>,
    codec: FrameCodec,
    id: ConnectionId,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let text = match codec.encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection_id = %id, frame = frame.name(), error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        let sent = tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = sink.send(Message::Text(text)) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(connection_id = %id, error = %e, "Send failed, stopping writer");
            return;
        }
    }
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        tracing::debug!(connection_id = %id, "Peer did not complete close");
    }
}

/// Protocol state for one connection, independent of the transport.
pub struct GatewayConnection {
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    codec: FrameCodec,
    outbound: mpsc::Sender<Frame>,
    state: ConnectionState,
    session: Option<Arc<Session>>,
}

impl GatewayConnection {
    pub fn new(
        id: ConnectionId,
        registry: Arc<SessionRegistry>,
        codec: FrameCodec,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            registry,
            codec,
            outbound,
            state: ConnectionState::Connected,
            session: None,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Reads transport messages until the peer leaves or shutdown starts.
    pub async fn run<S>(&mut self, mut source: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        self.state = ConnectionState::Handshaking;

        while self.state != ConnectionState::Closed {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = source.next() => message,
            };

            let text = match message {
                None => break,
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %self.id, error = %e, "Transport error");
                    break;
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    let err = ProtocolError::UnsupportedMessage(
                        "binary messages are not supported".to_string(),
                    );
                    self.reject(err);
                    continue;
                }
            };

            self.handle_text(&text).await;
        }

        self.close();
    }

    /// Decodes and handles one text message.
    pub async fn handle_text(&mut self, text: &str) {
        match self.codec.decode(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => self.reject(e),
        }
    }

    /// Handles one decoded frame according to the current state.
    pub async fn handle_frame(&mut self, frame: Frame) {
        tracing::trace!(connection_id = %self.id, frame = frame.name(), "Frame received");
        match self.state {
            ConnectionState::Connected | ConnectionState::Handshaking => {
                self.handshake(frame).await
            }
            ConnectionState::Attached => self.dispatch(frame),
            ConnectionState::Closed => {}
        }
    }

    async fn handshake(&mut self, frame: Frame) {
        let handle = ClientHandle::from_sender(self.id.clone(), self.outbound.clone());
        let result = match frame {
            Frame::NewSession(request) => {
                self.registry
                    .create_attached(CreateRequest::from(request), handle)
                    .await
            }
            Frame::Connect(request) => {
                self.registry
                    .attach(&request.session_id, handle, AttachKind::Joined)
            }
            other => {
                self.reject(ProtocolError::UnexpectedFrame {
                    frame: other.name(),
                    reason: "expected new_session or connect",
                });
                return;
            }
        };

        match result {
            Ok(session) => {
                tracing::info!(
                    connection_id = %self.id,
                    session_id = %session.id(),
                    "Handshake complete"
                );
                self.session = Some(session);
                self.state = ConnectionState::Attached;
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Handshake refused");
                self.send(Frame::error(handshake_failure(&e)));
                self.state = ConnectionState::Closed;
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let Some(session) = self.session.clone() else {
            return;
        };

        match frame {
            Frame::Input(input) => {
                session.send_input(&input.data);
            }
            Frame::Resize(Resize { cols, rows }) => {
                let current = session.geometry();
                let cols = cols.unwrap_or(current.cols);
                let rows = rows.unwrap_or(current.rows);
                if let Err(e) = session.resize(cols, rows) {
                    tracing::warn!(connection_id = %self.id, error = %e, "Resize rejected");
                    self.send(Frame::error(e.to_string()));
                }
            }
            Frame::Status(_) => {
                let status = session.status();
                self.send(Frame::StatusResponse(StatusReply { status }));
            }
            other => {
                self.reject(ProtocolError::UnexpectedFrame {
                    frame: other.name(),
                    reason: "not valid on an attached connection",
                });
            }
        }
    }

    /// Reports a protocol error to the peer.
    ///
    /// Before a successful handshake this also closes the connection.
    fn reject(&mut self, err: ProtocolError) {
        tracing::warn!(connection_id = %self.id, state = ?self.state, error = %err, "Protocol error");
        self.send(Frame::error(err.to_string()));
        if self.state != ConnectionState::Attached {
            self.state = ConnectionState::Closed;
        }
    }

    /// Queues a reply. Never waits on the peer; a full queue drops it.
    fn send(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                tracing::warn!(connection_id = %self.id, frame = frame.name(), "Outbound queue full, dropping reply");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "Outbound queue closed");
            }
        }
    }

    /// Detaches from the session, if any, and reaps finished sessions.
    fn close(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(session) = self.session.take() {
            session.detach(&self.id);
            let reaped = self.registry.reap();
            if !reaped.is_empty() {
                tracing::debug!(connection_id = %self.id, reaped = reaped.len(), "Reaped sessions");
            }
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn handshake_failure(err: &SessionError) -> String {
    match err {
        SessionError::NotFound(id) => format!("Session {} not found", id),
        other => format!("Failed to create session: {}", other),
    }
}
