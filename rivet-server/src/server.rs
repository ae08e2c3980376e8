//! TCP server implementation.

use crate::error::ServerError;
use crate::processor::RequestProcessor;
use crate::service::Service;
use crate::trace::Telemetry;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum number of connections served at once (None or zero = unlimited).
    pub max_concurrency: Option<usize>,
    /// How long in-flight connections may run after shutdown begins.
    pub stop_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            max_concurrency: None,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Limits the connections served at once. Zero means unlimited.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = (max_concurrency > 0).then_some(max_concurrency);
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Decrements the active connection count when a connection task ends,
/// including when it is aborted.
struct ActiveConnection(Arc<ServerStats>);

impl ActiveConnection {
    fn new(stats: Arc<ServerStats>) -> Self {
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serves a [`Service`] over TCP, one task per connection.
pub struct ConnectionServer {
    config: ServerConfig,
    service: Arc<Service>,
    telemetry: Arc<Telemetry>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    stopping: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ConnectionServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig, service: Arc<Service>, telemetry: Arc<Telemetry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            service,
            telemetry,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the address the server is listening on, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shut down,
    /// then waits up to `stop_timeout` for open connections to finish.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let max_concurrency = self.config.max_concurrency.filter(|&limit| limit > 0);
        match max_concurrency {
            Some(limit) => tracing::info!(
                "Server listening on {} (max {} connections)",
                addr,
                limit
            ),
            None => tracing::info!("Server listening on {}", addr),
        }

        let slots = max_concurrency.map(|limit| Arc::new(Semaphore::new(limit)));
        let mut connections = JoinSet::new();

        while !self.stopping.load(Ordering::SeqCst) {
            // Admission happens before accept: with every slot taken, new
            // peers wait in the listen backlog.
            let permit = match &slots {
                Some(slots) => {
                    match Self::acquire_slot(slots, &mut shutdown_rx, &mut connections).await {
                        Some(permit) => Some(permit),
                        None => break,
                    }
                }
                None => None,
            };

            let accepted = loop {
                tokio::select! {
                    result = listener.accept() => break Some(result),
                    _ = shutdown_rx.recv() => break None,
                    Some(joined) = connections.join_next(), if !connections.is_empty() => {
                        Self::reap(joined);
                    }
                }
            };

            match accepted {
                Some(Ok((stream, peer))) => {
                    let active = ActiveConnection::new(self.stats.clone());
                    let processor =
                        RequestProcessor::new(self.service.clone(), self.telemetry.clone())
                            .with_peer(peer)
                            .with_stats(self.stats.clone())
                            .with_shutdown(self.shutdown.subscribe());
                    let stopping = self.stopping.clone();
                    let stats = self.stats.clone();
                    connections.spawn(async move {
                        let _active = active;
                        let _permit = permit;
                        if let Err(e) =
                            Self::handle_connection(stream, peer, processor, &stopping).await
                        {
                            tracing::warn!("[{}] Connection error: {}", peer, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                        tracing::info!("Client disconnected: {}", peer);
                    });
                }
                Some(Err(e)) => {
                    tracing::error!("Accept error: {}", e);
                }
                None => break,
            }
        }

        tracing::info!("Server shutting down");
        drop(listener);
        self.drain(&mut connections).await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Begins a graceful shutdown. Safe to call before or during `serve`.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    async fn acquire_slot(
        slots: &Arc<Semaphore>,
        shutdown: &mut broadcast::Receiver<()>,
        connections: &mut JoinSet<()>,
    ) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                permit = slots.clone().acquire_owned() => return permit.ok(),
                _ = shutdown.recv() => return None,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    Self::reap(joined);
                }
            }
        }
    }

    async fn drain(&self, connections: &mut JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        tracing::info!(
            "Waiting up to {:?} for {} connection(s) to finish",
            self.config.stop_timeout,
            connections.len()
        );
        let finished = tokio::time::timeout(self.config.stop_timeout, async {
            while let Some(joined) = connections.join_next().await {
                Self::reap(joined);
            }
        })
        .await;
        if finished.is_err() {
            tracing::warn!(
                "Aborting {} connection(s) still open after {:?}",
                connections.len(),
                self.config.stop_timeout
            );
            connections.shutdown().await;
        }
    }

    fn reap(joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!("Connection task panicked: {}", e);
            }
        }
    }

    /// Runs the request loop for a single connection.
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        mut processor: RequestProcessor,
        stopping: &AtomicBool,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", peer);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", peer, e);
        }
        let (mut reader, mut writer) = stream.into_split();

        let result = loop {
            if stopping.load(Ordering::SeqCst) {
                tracing::debug!("[{}] Server stopping, closing connection", peer);
                break Ok(());
            }
            match processor.process(&mut reader, &mut writer).await {
                Ok(()) => {}
                Err(ServerError::ShuttingDown) => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    break Ok(());
                }
                Err(e) if e.is_disconnect() => {
                    tracing::debug!("[{}] Peer disconnected: {}", peer, e);
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = writer.shutdown().await {
            tracing::debug!("[{}] Error closing connection: {}", peer, e);
        }
        result
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
