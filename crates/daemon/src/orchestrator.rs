//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry from configuration, runs the WebSocket gateway, and tears both
//! down again on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::FrameCodec;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::gateway::{GatewayError, GatewayServer};
use crate::session::{ProcessLauncher, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the gateway.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The gateway is accepting connections.
    Listening { addr: SocketAddr },
    /// The gateway stopped because of an error.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistry>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Address the gateway is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// Running gateway task.
    gateway: Option<JoinHandle<Result<(), GatewayError>>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let launcher = ProcessLauncher::new(&config.session.shell, &config.session.term);
        let registry = Arc::new(SessionRegistry::new(
            launcher,
            config.session.registry_settings(),
        ));

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            shutdown_token: CancellationToken::new(),
            local_addr: None,
            gateway: None,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the gateway and starts serving connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let addr = self.config.server.listen_addr()?;
        let codec = FrameCodec::with_max_frame_size(self.config.server.max_frame_bytes);
        let server = match GatewayServer::bind(
            addr,
            Arc::clone(&self.registry),
            codec,
            self.shutdown_token.child_token(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).context("Failed to start gateway");
            }
        };

        let local_addr = server.local_addr()?;
        self.local_addr = Some(local_addr);

        let event_tx = self.event_tx.clone();
        self.gateway = Some(tokio::spawn(async move {
            let result = server.run().await;
            if let Err(e) = &result {
                error!("Gateway stopped: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
            result
        }));

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon listening on ws://{}", local_addr);
        Ok(())
    }

    /// Stops the gateway and every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                debug!("Orchestrator already stopped");
                return Ok(());
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        // Sessions are stopped while the gateway drains, so a connection
        // waiting on a session cannot hold up shutdown.
        let gateway = self.gateway.take();
        let (joined, ()) = tokio::join!(
            async move {
                match gateway {
                    Some(handle) => handle.await,
                    None => Ok(Ok(())),
                }
            },
            self.registry.shutdown_all(),
        );
        // Handshakes in flight at cancellation may have registered more.
        self.registry.shutdown_all().await;
        debug!("All sessions stopped");

        let gateway_result = joined.context("Gateway task panicked")?;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        gateway_result.context("Gateway failed")
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address the gateway is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GatewayClient;
    use crate::session::CreateRequest;

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.session.working_dir = Some(std::env::temp_dir());
        config.session.poll_interval_ms = 20;
        config.session.stop_grace_ms = 500;
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert_eq!(orchestrator.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = create_test_config();
        config.server.listen_addr = "nowhere".to_string();
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(OrchestratorState::Starting)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::Listening { addr: a } if a == addr
        ));

        let client = GatewayClient::connect(&format!("ws://{}", addr)).await;
        assert!(client.is_ok());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_terminates_sessions() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();

        let session = orchestrator
            .registry()
            .create(CreateRequest::new("sleep 30"))
            .await
            .unwrap();
        assert!(session.is_running());

        orchestrator.stop().await.unwrap();
        assert!(session.is_exited());
        assert_eq!(orchestrator.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_completes_with_unread_client() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        orchestrator.start().await.unwrap();
        let addr = orchestrator.local_addr().unwrap();

        // A client that never reads while `yes` floods its connection, and
        // another whose session never drains stdin.
        let mut flooded = GatewayClient::connect(&format!("ws://{}", addr)).await.unwrap();
        flooded.new_session("yes", 80, 24, None).await.unwrap();
        let mut paster = GatewayClient::connect(&format!("ws://{}", addr)).await.unwrap();
        paster.new_session("sleep 30", 80, 24, None).await.unwrap();
        paster.send_input(&"x".repeat(200 * 1024)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        tokio::time::timeout(std::time::Duration::from_secs(10), orchestrator.stop())
            .await
            .expect("stop hung")
            .unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.registry().count(), 0);

        drop(flooded);
        drop(paster);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let mut orchestrator = DaemonOrchestrator::new(create_test_config()).unwrap();
        assert!(orchestrator.stop().await.is_ok());
    }
}
