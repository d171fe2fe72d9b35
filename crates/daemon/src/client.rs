//! WebSocket client for the gateway.
//!
//! Used by the `run`, `attach` and `status` subcommands and by the
//! integration tests. The client speaks the same frames as a browser would.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{Frame, FrameCodec, ProtocolError, SessionAck, SessionStatus};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Default timeout for request/reply exchanges.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by [`GatewayClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered with an `error` frame.
    #[error("server error: {0}")]
    Rejected(String),

    /// The server sent a frame that makes no sense here.
    #[error("unexpected {0} frame")]
    Unexpected(&'static str),

    /// No reply arrived in time.
    #[error("operation timed out")]
    Timeout,

    /// The server closed the connection.
    #[error("connection closed")]
    Closed,
}

/// A connection to the gateway.
pub struct GatewayClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: FrameCodec,
    timeout: Duration,
    /// Frames received while waiting for a specific reply.
    backlog: VecDeque<Frame>,
}

impl GatewayClient {
    /// Opens a WebSocket connection to `url` (e.g. `ws://127.0.0.1:8765`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _response) = tokio::time::timeout(DEFAULT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout)??;

        Ok(Self {
            stream,
            codec: FrameCodec::new(),
            timeout: DEFAULT_TIMEOUT,
            backlog: VecDeque::new(),
        })
    }

    /// Set the timeout for request/reply exchanges.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let text = self.codec.encode(frame)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends raw text, bypassing the codec.
    pub async fn send_raw(&mut self, text: impl Into<String>) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Receives the next frame, or `None` once the server closes.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(Some(frame));
        }
        self.read_frame().await
    }

    /// Like [`next_frame`](Self::next_frame) but gives up after `timeout`.
    pub async fn next_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Frame>, ClientError> {
        tokio::time::timeout(timeout, self.next_frame())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Some(self.codec.decode(&text)?)),
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Starts a new session running `command`.
    pub async fn new_session(
        &mut self,
        command: &str,
        cols: u16,
        rows: u16,
        cwd: Option<String>,
    ) -> Result<SessionAck, ClientError> {
        let mut frame = Frame::new_session(command, cols, rows);
        if let Frame::NewSession(request) = &mut frame {
            request.cwd = cwd;
        }
        self.send(&frame).await?;
        match self.reply().await? {
            Frame::SessionCreated(ack) => Ok(ack),
            other => Err(ClientError::Unexpected(other.name())),
        }
    }

    /// Joins an existing session.
    pub async fn attach(&mut self, session_id: &str) -> Result<SessionAck, ClientError> {
        self.send(&Frame::connect(session_id)).await?;
        match self.reply().await? {
            Frame::Connected(ack) => Ok(ack),
            other => Err(ClientError::Unexpected(other.name())),
        }
    }

    pub async fn send_input(&mut self, data: &str) -> Result<(), ClientError> {
        self.send(&Frame::input(data)).await
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(&Frame::resize(cols, rows)).await
    }

    /// Queries session status.
    ///
    /// Frames that arrive before the reply are kept and returned by later
    /// calls to [`next_frame`](Self::next_frame).
    pub async fn status(&mut self) -> Result<SessionStatus, ClientError> {
        self.send(&Frame::status_query()).await?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.read_frame())
                .await
                .map_err(|_| ClientError::Timeout)??
                .ok_or(ClientError::Closed)?;
            match frame {
                Frame::StatusResponse(reply) => return Ok(reply.status),
                Frame::Error(err) => return Err(ClientError::Rejected(err.message)),
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// First frame of a handshake reply; `error` frames become errors.
    async fn reply(&mut self) -> Result<Frame, ClientError> {
        match tokio::time::timeout(self.timeout, self.next_frame())
            .await
            .map_err(|_| ClientError::Timeout)??
        {
            Some(Frame::Error(err)) => Err(ClientError::Rejected(err.message)),
            Some(frame) => Ok(frame),
            None => Err(ClientError::Closed),
        }
    }
}
