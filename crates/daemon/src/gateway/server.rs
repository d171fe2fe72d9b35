//! Listener side of the gateway.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::FrameCodec;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection;
use super::GatewayError;
use crate::session::SessionRegistry;

/// Accepts WebSocket connections and serves each on its own task.
pub struct GatewayServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    codec: FrameCodec,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Binds the listening socket.
    ///
    /// Binding port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        codec: FrameCodec,
        shutdown: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;

        tracing::info!(addr = %addr, "Gateway listening");
        Ok(Self {
            listener,
            registry,
            codec,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.listener.local_addr().map_err(GatewayError::Accept)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serves connections until shutdown is requested.
    ///
    /// Waits for every connection task to wind down before returning. An
    /// unrecoverable listener error ends the server.
    pub async fn run(self) -> Result<(), GatewayError> {
        let tracker = TaskTracker::new();

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Gateway shutting down");
                    break Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Accepted TCP connection");
                        tracker.spawn(connection::serve(
                            stream,
                            peer,
                            Arc::clone(&self.registry),
                            self.codec,
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) if is_transient(&e) => {
                        tracing::warn!(error = %e, "Transient accept failure");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Listener failed");
                        self.shutdown.cancel();
                        break Err(GatewayError::Accept(e));
                    }
                }
            }
        };

        tracker.close();
        tracker.wait().await;
        tracing::debug!("All gateway connections closed");
        result
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
