//! Session registry.
//!
//! Process-wide table of live sessions keyed by id. Creation, lookup,
//! attachment and reaping are safe to call from any connection task; a
//! session is only ever removed while it has exited and nobody is attached.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{NewSession, SessionStatus};
use uuid::Uuid;

use super::multiplexer::{queue_capacity, ClientHandle};
use super::process::ProcessLauncher;
use super::terminal::{AttachKind, Geometry, Session, SessionError, SessionId, SessionOptions};

/// Default upper bound on concurrently registered sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Options applied to every session.
    pub session: SessionOptions,
    /// Working directory for sessions that do not name one. Falls back to
    /// the daemon's own working directory.
    pub working_dir: Option<PathBuf>,
    /// Maximum number of registered sessions.
    pub max_sessions: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            working_dir: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Parameters for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub command: String,
    pub geometry: Geometry,
    pub working_dir: Option<PathBuf>,
}

impl CreateRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            geometry: Geometry::default(),
            working_dir: None,
        }
    }

    pub fn with_geometry(mut self, cols: u16, rows: u16) -> Self {
        self.geometry = Geometry::new(cols, rows);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl From<NewSession> for CreateRequest {
    fn from(request: NewSession) -> Self {
        Self {
            command: request.command,
            geometry: Geometry::new(request.cols, request.rows),
            working_dir: request.cwd.map(PathBuf::from),
        }
    }
}

/// Thread-safe table of sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Registered sessions plus creations in flight; never exceeds the limit.
    slots: AtomicUsize,
    launcher: ProcessLauncher,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(launcher: ProcessLauncher, settings: RegistrySettings) -> Self {
        Self {
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
            launcher,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Outbound queue capacity for connections attaching to sessions here.
    pub fn client_queue_capacity(&self) -> usize {
        queue_capacity(self.settings.session.history_capacity)
    }

    /// Launches a new session and registers it.
    ///
    /// A session whose launch fails is never registered.
    pub async fn create(&self, request: CreateRequest) -> Result<Arc<Session>, SessionError> {
        self.create_with(request, None).await
    }

    /// Launches a new session with `creator` already attached.
    ///
    /// The creator is attached before the session becomes visible, so even a
    /// command that exits immediately cannot be reaped out from under it.
    pub async fn create_attached(
        &self,
        request: CreateRequest,
        creator: ClientHandle,
    ) -> Result<Arc<Session>, SessionError> {
        self.create_with(request, Some(creator)).await
    }

    async fn create_with(
        &self,
        request: CreateRequest,
        creator: Option<ClientHandle>,
    ) -> Result<Arc<Session>, SessionError> {
        if !self.reserve_slot() {
            self.reap();
            if !self.reserve_slot() {
                tracing::warn!(
                    max_sessions = self.settings.max_sessions,
                    "Refusing new session, limit reached"
                );
                return Err(SessionError::LimitReached(self.settings.max_sessions));
            }
        }

        let session = match self.launch(request).await {
            Ok(session) => session,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };

        if let Some(creator) = creator {
            session.attach(creator, AttachKind::Created);
        }
        self.sessions
            .insert(session.id().clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %session.id(),
            sessions = self.sessions.len(),
            "Session registered"
        );
        Ok(session)
    }

    async fn launch(&self, request: CreateRequest) -> Result<Arc<Session>, SessionError> {
        let working_dir = match request.working_dir.or_else(|| self.settings.working_dir.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let session = Session::new(
            Uuid::new_v4().to_string(),
            request.command,
            working_dir,
            request.geometry,
            self.settings.session.clone(),
        );
        session.start(&self.launcher).await?;
        Ok(session)
    }

    /// Claims room for one more session, if the limit allows.
    fn reserve_slot(&self) -> bool {
        let max = self.settings.max_sessions;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.slots.fetch_sub(1, Ordering::AcqRel);
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Attaches a connection to an existing session.
    ///
    /// Runs while holding the registry entry, so a concurrent reap cannot
    /// remove the session between lookup and attachment.
    pub fn attach(
        &self,
        id: &str,
        handle: ClientHandle,
        kind: AttachKind,
    ) -> Result<Arc<Session>, SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.value().attach(handle, kind);
        Ok(Arc::clone(entry.value()))
    }

    /// Removes every exited session with no attached connections.
    ///
    /// Returns the ids that were removed.
    pub fn reap(&self) -> Vec<SessionId> {
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_reapable())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for id in candidates {
            if let Some((id, session)) = self
                .sessions
                .remove_if(&id, |_, session| session.is_reapable())
            {
                self.release_slot();
                session.close();
                tracing::info!(session_id = %id, exit_code = ?session.exit_code(), "Session reaped");
                reaped.push(id);
            }
        }
        reaped
    }

    /// Status of every registered session.
    pub fn list(&self) -> Vec<SessionStatus> {
        self.sessions
            .iter()
            .map(|entry| entry.value().status())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every session and empties the registry.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!(sessions = sessions.len(), "Stopping all sessions");
        let stops = sessions.iter().map(|session| session.stop());
        futures_util::future::join_all(stops).await;

        for session in &sessions {
            session.close();
            if self.sessions.remove(session.id()).is_some() {
                self.release_slot();
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(ProcessLauncher::default(), RegistrySettings::default())
    }
}
