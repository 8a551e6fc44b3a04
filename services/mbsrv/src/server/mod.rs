//! Modbus TCP server
//!
//! One accept loop plus one task per connection. Stopping cancels the accept
//! loop, gives open connections `shutdown_grace` to finish the transaction
//! they are in, aborts whatever is left, and only then drops the listener.

pub mod connection;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::LifecycleError;
use crate::handler::TransactionHandler;

pub use connection::CloseReason;
pub use stats::{ClientSnapshot, ClientStats, ConnectionGuard};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime settings of the accept loop
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            max_connections: cfg.max_connections,
            idle_timeout: cfg.idle_timeout(),
            shutdown_grace: cfg.shutdown_grace(),
        }
    }
}

/// A bound, not yet serving, server
pub struct ModbusServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<TransactionHandler>,
    stats: Arc<ClientStats>,
    settings: ServerSettings,
}

/// Handle to a serving accept loop
#[derive(Debug)]
pub struct RunningServer {
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ModbusServer {
    /// Bind the listener; fails fast so the caller can report it
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<TransactionHandler>,
        stats: Arc<ClientStats>,
        settings: ServerSettings,
    ) -> Result<Self, LifecycleError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LifecycleError::bind(addr, e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            handler,
            stats,
            settings,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop
    pub fn spawn(self) -> RunningServer {
        let cancel = CancellationToken::new();
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.run(cancel.clone()));
        info!("Modbus TCP server listening on {}", local_addr);
        RunningServer {
            local_addr,
            cancel,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            local_addr,
            handler,
            stats,
            settings,
        } = self;
        let mut connections: JoinSet<CloseReason> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {},
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            match accept_backoff(&e) {
                                None => debug!("Transient accept error: {}", e),
                                Some(delay) => {
                                    warn!(
                                        "Accept on {} failed: {}, retrying in {:?}",
                                        local_addr, e, delay
                                    );
                                    tokio::time::sleep(delay).await;
                                },
                            }
                            continue;
                        },
                    };

                    if connections.len() >= settings.max_connections {
                        warn!(
                            "Connection limit {} reached, rejecting {}",
                            settings.max_connections, peer
                        );
                        drop(stream);
                        continue;
                    }

                    debug!("Accepted connection from {}", peer);
                    connections.spawn(connection::serve(
                        stream,
                        peer,
                        handler.clone(),
                        stats.clone(),
                        settings.idle_timeout,
                        cancel.child_token(),
                    ));
                },
            }
        }

        // Connections see the same token through their child tokens
        cancel.cancel();
        let open = connections.len();
        if open > 0 {
            debug!("Draining {} connections", open);
        }
        let drained = tokio::time::timeout(settings.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still busy after {:?}, aborting",
                connections.len(),
                settings.shutdown_grace
            );
            connections.shutdown().await;
        }

        drop(listener);
        info!("Modbus TCP server on {} stopped", local_addr);
    }
}

/// Pause before accepting again after a non-transient error (fd exhaustion
/// and the like); `None` retries immediately
fn accept_backoff(e: &std::io::Error) -> Option<Duration> {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

impl RunningServer {
    /// Whether the accept loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the accept loop to drain and close
    pub async fn stop(self) -> Result<(), LifecycleError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the accept loop without cancelling it
    pub async fn join(self) -> Result<(), LifecycleError> {
        match self.task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(LifecycleError::Watchdog(format!("server task panicked: {}", e))),
        }
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}
