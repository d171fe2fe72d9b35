//! Terminal sessions.
//!
//! A session owns one launched process and everything the gateway needs to
//! share it: the stdin writer, a reader task that turns merged output into
//! `output` frames, the bounded history, and the set of attached connections.
//! A session runs exactly once; after its process exits it stays readable
//! (status, history replay) until the registry reaps it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use protocol::{unix_timestamp, Frame, SessionAck, SessionStatus};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decode::OutputDecoder;
use super::history::DEFAULT_HISTORY_CAPACITY;
use super::multiplexer::{
    queue_capacity, ClientHandle, ClientStats, ConnectionId, FanoutCounts,
    SessionOutputBroadcaster,
};
use super::process::{exit_code, ChildProcess, LaunchError, LaunchSpec, ProcessGroup, ProcessLauncher};

/// Unique identifier for a session.
pub type SessionId = String;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Input chunks queued for the stdin writer before new input is dropped.
const INPUT_QUEUE_CAPACITY: usize = 256;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process could not be launched.
    #[error("failed to launch session: {0}")]
    Launch(#[from] LaunchError),

    /// The session was already started once.
    #[error("session already started: {0}")]
    AlreadyStarted(SessionId),

    /// Writing to the process's stdin failed.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// A resize asked for a zero-sized terminal.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    /// The configured session limit was reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Exited,
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(protocol::DEFAULT_COLS, protocol::DEFAULT_ROWS)
    }
}

/// Tunables shared by every session a registry creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Output frames retained for replay.
    pub history_capacity: usize,
    /// How often the reader checks whether the process has exited.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when stopping.
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// How a connection came to be attached, which decides its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    /// The connection created the session (`session_created`).
    Created,
    /// The connection joined an existing session (`connected`).
    Joined,
}

/// A single command running on behalf of any number of connections.
pub struct Session {
    id: SessionId,
    command: String,
    working_dir: PathBuf,
    start_time: f64,
    options: SessionOptions,

    state: watch::Sender<SessionState>,
    exit_code: Mutex<Option<i32>>,
    geometry: Mutex<Geometry>,

    group: OnceLock<ProcessGroup>,
    child: tokio::sync::Mutex<Option<ChildProcess>>,
    /// Feeds the stdin writer task; `None` once input is closed.
    input: Mutex<Option<mpsc::Sender<String>>>,

    output: SessionOutputBroadcaster,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Creates a session in the `Created` state. Nothing is launched yet.
    pub fn new(
        id: SessionId,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        geometry: Geometry,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        Arc::new(Self {
            id,
            command: command.into(),
            working_dir: working_dir.into(),
            start_time: unix_timestamp(),
            output: SessionOutputBroadcaster::new(options.history_capacity),
            options,
            state,
            exit_code: Mutex::new(None),
            geometry: Mutex::new(geometry),
            group: OnceLock::new(),
            child: tokio::sync::Mutex::new(None),
            input: Mutex::new(None),
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    /// Launches the process and starts the output reader.
    ///
    /// A session can only be started once. On launch failure the session
    /// goes straight to `Exited` and the error is returned.
    pub async fn start(self: &Arc<Self>, launcher: &ProcessLauncher) -> Result<(), SessionError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SessionError::AlreadyStarted(self.id.clone()));
        }

        let geometry = self.geometry();
        let spec = LaunchSpec {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            cols: geometry.cols,
            rows: geometry.rows,
        };

        let launched = match launcher.launch(&spec) {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Failed to launch session");
                self.mark_exited(None);
                return Err(e.into());
            }
        };

        let group = launched.child.group();
        let _ = self.group.set(group);
        *self.child.lock().await = Some(launched.child);

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        *self.input.lock() = Some(input_tx);
        let writer = tokio::spawn(write_stdin(
            self.id.clone(),
            launched.stdin,
            input_rx,
            self.cancel.clone(),
        ));
        *self.writer.lock() = Some(writer);
        self.state.send_replace(SessionState::Running);

        tracing::info!(
            session_id = %self.id,
            pid = group.id(),
            command = %self.command,
            cols = geometry.cols,
            rows = geometry.rows,
            "Session started"
        );

        let handle = tokio::spawn(Arc::clone(self).read_loop(launched.output));
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn geometry(&self) -> Geometry {
        *self.geometry.lock()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn is_exited(&self) -> bool {
        self.state() == SessionState::Exited
    }

    /// Exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Pid of the process group leader, once launched.
    pub fn pid(&self) -> Option<u32> {
        self.group.get().map(|g| g.id())
    }

    /// Capacity to give each attached connection's outbound queue.
    pub fn client_queue_capacity(&self) -> usize {
        queue_capacity(self.options.history_capacity)
    }

    /// Waits until the session has exited.
    pub async fn wait_exited(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Exited).await;
    }

    /// Attaches a connection.
    ///
    /// The acknowledgement for `kind` is queued first, followed by every
    /// retained output frame. Returns the number of frames replayed.
    pub fn attach(&self, handle: ClientHandle, kind: AttachKind) -> usize {
        let connection_id = handle.id().clone();
        let replayed = self.output.attach(handle, |counts| {
            let ack = SessionAck {
                session_id: self.id.clone(),
                status: self.status_with(counts),
            };
            match kind {
                AttachKind::Created => Frame::SessionCreated(ack),
                AttachKind::Joined => Frame::Connected(ack),
            }
        });
        tracing::info!(
            session_id = %self.id,
            connection_id = %connection_id,
            replayed = replayed,
            "Connection attached"
        );
        replayed
    }

    /// Detaches a connection. Returns false if it was not attached.
    pub fn detach(&self, connection_id: &ConnectionId) -> bool {
        match self.output.detach(connection_id) {
            Some(stats) => {
                tracing::info!(
                    session_id = %self.id,
                    connection_id = %connection_id,
                    sent = stats.messages_sent,
                    dropped = stats.messages_dropped,
                    "Connection detached"
                );
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.output.client_count()
    }

    pub fn buffer_size(&self) -> usize {
        self.output.history_len()
    }

    pub fn client_stats(&self, connection_id: &ConnectionId) -> Option<ClientStats> {
        self.output.client_stats(connection_id)
    }

    /// True once the process has exited and nobody is attached.
    pub fn is_reapable(&self) -> bool {
        self.is_exited() && self.output.client_count() == 0
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status_with(self.output.counts())
    }

    fn status_with(&self, counts: FanoutCounts) -> SessionStatus {
        let state = self.state();
        let geometry = self.geometry();
        SessionStatus {
            session_id: self.id.clone(),
            command: self.command.clone(),
            start_time: self.start_time,
            is_active: state == SessionState::Running && !self.cancel.is_cancelled(),
            process_running: matches!(state, SessionState::Starting | SessionState::Running),
            client_count: counts.clients,
            buffer_size: counts.buffered,
            cols: geometry.cols,
            rows: geometry.rows,
            exit_code: self.exit_code(),
        }
    }

    /// Queues client input for the process.
    ///
    /// Accepted input is echoed to every attached connection before it is
    /// written, and only input that was actually queued is echoed. Never
    /// waits on the process: when the queue is full or input is closed the
    /// input is dropped and false is returned. Failures are logged and never
    /// surfaced to the sender.
    pub fn send_input(&self, data: &str) -> bool {
        if !self.is_running() {
            tracing::debug!(session_id = %self.id, "Dropping input for inactive session");
            return false;
        }

        // Held across reserve, echo and send so echoes follow write order.
        let input = self.input.lock();
        let Some(tx) = input.as_ref() else {
            tracing::warn!(session_id = %self.id, "Dropping input, stdin already closed");
            return false;
        };

        let sent = match tx.try_reserve() {
            Ok(permit) => {
                self.output.broadcast(Frame::input_echo(self.id.clone(), data));
                permit.send(data.to_string());
                true
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                let err = SessionError::WriteFailed("input queue full".to_string());
                tracing::warn!(session_id = %self.id, bytes = data.len(), error = %err, "Input dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                let err = SessionError::WriteFailed("stdin closed".to_string());
                tracing::warn!(session_id = %self.id, error = %err, "Input dropped");
                false
            }
        };
        sent
    }

    /// Changes the terminal geometry and notifies the process group.
    ///
    /// Returns false without signalling when the geometry is unchanged.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<bool, SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }

        {
            let mut geometry = self.geometry.lock();
            if geometry.cols == cols && geometry.rows == rows {
                return Ok(false);
            }
            *geometry = Geometry::new(cols, rows);
        }

        tracing::info!(session_id = %self.id, cols = cols, rows = rows, "Session resized");

        if self.is_running() {
            if let Some(group) = self.group.get() {
                if let Err(e) = group.notify_resize() {
                    tracing::warn!(session_id = %self.id, error = %e, "Failed to signal resize");
                }
            }
        }
        Ok(true)
    }

    /// Stops the session: SIGTERM, a grace period, then SIGKILL.
    ///
    /// Idempotent; stopping an exited session does nothing.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut code = None;
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            tracing::info!(session_id = %self.id, pid = child.group().id(), "Stopping session");
            match child.terminate(self.options.stop_grace).await {
                Ok(status) => code = exit_code(&status),
                Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Failed to reap process"),
            }
        }
        self.input.lock().take();

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                tracing::error!(session_id = %self.id, error = %e, "Reader task failed");
            }
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!(session_id = %self.id, error = %e, "Stdin writer task failed");
            }
        }

        self.mark_exited(code);
    }

    /// Drops every attached connection and halts background work.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.output.clear();
    }

    fn mark_exited(&self, code: Option<i32>) {
        {
            let mut exit_code = self.exit_code.lock();
            if exit_code.is_none() {
                *exit_code = code;
            }
        }
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Exited {
                false
            } else {
                *state = SessionState::Exited;
                true
            }
        });
        if changed {
            tracing::info!(session_id = %self.id, exit_code = ?self.exit_code(), "Session exited");
        }
    }

    fn publish_output(&self, data: String) {
        self.output.publish(Frame::output(self.id.clone(), data));
    }

    /// Reaps the process if it has exited. Never blocks on `stop`.
    fn try_reap(&self) -> Option<Option<i32>> {
        let mut slot = self.child.try_lock().ok()?;
        let Some(child) = slot.as_mut() else {
            return Some(None);
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                slot.take();
                Some(exit_code(&status))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to poll process");
                None
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut output: pipe::Receiver) {
        let poll_interval = self.options.poll_interval;
        let mut decoder = OutputDecoder::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut eof = false;
        // Set once the process is reaped; output still in the pipe is
        // drained until EOF or one idle poll.
        let mut reaped: Option<Option<i32>> = None;

        let exited = loop {
            if eof {
                if reaped.is_some() {
                    break reaped;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break None,
                    _ = tokio::time::sleep(poll_interval) => {
                        if let Some(code) = self.try_reap() {
                            break Some(code);
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(session_id = %self.id, "Reader cancelled");
                    break None;
                }
                read = tokio::time::timeout(poll_interval, output.read(&mut buffer)) => match read {
                    Ok(Ok(0)) => {
                        tracing::debug!(session_id = %self.id, "Output stream closed");
                        eof = true;
                        if let Some(rest) = decoder.finish() {
                            self.publish_output(rest);
                        }
                    }
                    Ok(Ok(n)) => {
                        let text = decoder.decode(&buffer[..n]);
                        if !text.is_empty() {
                            self.publish_output(text);
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!(session_id = %self.id, error = %e, "Error reading process output");
                        eof = true;
                    }
                    Err(_) => {
                        if reaped.is_some() {
                            break reaped;
                        }
                        reaped = self.try_reap();
                    }
                }
            }
        };

        drop(output);
        if let Some(rest) = decoder.finish() {
            self.publish_output(rest);
        }

        if let Some(code) = exited {
            self.input.lock().take();
            self.mark_exited(code);
        }
        tracing::debug!(session_id = %self.id, "Reader loop ended");
    }
}

/// Writes queued input to the process's stdin.
///
/// Ends when input is closed, the session is cancelled, or a write fails.
/// Cancellation interrupts a write that is stuck on a full pipe.
async fn write_stdin(
    session_id: SessionId,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = async {
                stdin.write_all(data.as_bytes()).await?;
                stdin.flush().await
            } => written,
        };

        if let Err(e) = written {
            let err = SessionError::WriteFailed(e.to_string());
            tracing::warn!(session_id = %session_id, error = %err, "Input not delivered, closing stdin");
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "Stdin writer ended");
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("state", &self.state())
            .field("geometry", &self.geometry())
            .field("pid", &self.pid())
            .finish()
    }
}
