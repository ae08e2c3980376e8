//! Bounded connection pool for a single endpoint.
//!
//! Capacity is a set of slots (semaphore permits). A slot is either held by a
//! caller, or free; free slots may keep a live connection on a LIFO idle
//! stack. Live connections (held plus idle) never exceed the pool size.

use crate::connection::{Connection, Connector, SocketConnector};
use crate::endpoint::Endpoint;
use crate::error::{ClientError, TransportError};
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of slots.
    pub size: usize,
    /// Connections older than this are closed instead of reused.
    pub max_age: Duration,
    /// Bounds the wait for a slot, each connect attempt and each call.
    pub timeout: Duration,
    /// Connect attempts per acquisition.
    pub max_retries: u32,
    /// Optional exponential backoff `(base, max)` between connect attempts.
    pub retry_backoff: Option<(Duration, Duration)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            max_age: Duration::from_secs(120),
            timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = Some((base, max));
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retries);
        match self.retry_backoff {
            Some((base, max)) => policy.with_backoff(base, max),
            None => policy,
        }
    }
}

/// Decrements the live connection count when dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tracked {
    connection: Connection,
    created: Instant,
    _live: LiveGuard,
}

struct PoolInner {
    endpoint: Endpoint,
    config: PoolConfig,
    retry_policy: RetryPolicy,
    connector: Arc<dyn Connector>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Tracked>>,
    live: Arc<AtomicUsize>,
}

/// A connection checked out of the pool.
///
/// Holds one slot. Dropping it without [`ConnectionPool::release`] closes the
/// transport and frees the slot empty.
pub struct PooledConnection {
    tracked: Option<Tracked>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Returns when the underlying connection was established.
    pub fn created(&self) -> Instant {
        self.tracked().created
    }

    fn tracked(&self) -> &Tracked {
        match &self.tracked {
            Some(tracked) => tracked,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tracked().connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.tracked {
            Some(tracked) => &mut tracked.connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.tracked.as_ref().map(|t| &t.connection))
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            tracing::debug!(
                "[conn {}] dropped without release, discarding",
                tracked.connection.id()
            );
        }
    }
}

/// A bounded pool of connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool that connects over TCP or Unix sockets.
    pub fn new(endpoint: Endpoint, config: PoolConfig) -> Self {
        Self::with_connector(endpoint, config, Arc::new(SocketConnector))
    }

    /// Creates a pool that opens transports through `connector`.
    pub fn with_connector(
        endpoint: Endpoint,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                retry_policy: config.retry_policy(),
                slots: Arc::new(Semaphore::new(config.size)),
                idle: Mutex::new(Vec::with_capacity(config.size)),
                live: Arc::new(AtomicUsize::new(0)),
                config,
                connector,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of open connections, held or idle.
    pub fn live_connections(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of connections waiting on the idle stack.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of slots not currently held by a caller.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Checks a connection out of the pool.
    ///
    /// Waits up to `timeout` for a slot. Reuses the most recently released
    /// connection unless it has outlived `max_age`, otherwise connects with
    /// one attempt per retry token.
    pub async fn acquire(&self) -> Result<PooledConnection, ClientError> {
        let inner = &self.inner;
        let permit = tokio::time::timeout(inner.config.timeout, inner.slots.clone().acquire_owned())
            .await
            .map_err(|_| TransportError::PoolExhausted)?
            .map_err(|_| TransportError::Closed)?;

        let idle = inner.idle.lock().pop();
        if let Some(mut tracked) = idle {
            if tracked.created.elapsed() < inner.config.max_age && tracked.connection.is_open() {
                return Ok(PooledConnection {
                    tracked: Some(tracked),
                    _permit: permit,
                });
            }
            tracing::debug!(
                "[conn {}] closing stale connection to {}",
                tracked.connection.id(),
                inner.endpoint
            );
            tracked.connection.close().await;
        }

        for attempt in inner.retry_policy.attempts() {
            if !attempt.delay.is_zero() {
                tokio::time::sleep(attempt.delay).await;
            }
            let connect = inner.connector.connect(&inner.endpoint);
            match tokio::time::timeout(inner.config.timeout, connect).await {
                Ok(Ok(stream)) => {
                    let transport = stream.kind();
                    let connection = Connection::new(
                        stream,
                        inner.endpoint.to_string(),
                        inner.config.timeout,
                    );
                    tracing::debug!(
                        "[conn {}] connected to {} over {} (attempt {})",
                        connection.id(),
                        inner.endpoint,
                        transport,
                        attempt.number + 1
                    );
                    return Ok(PooledConnection {
                        tracked: Some(Tracked {
                            connection,
                            created: Instant::now(),
                            _live: LiveGuard::new(&inner.live),
                        }),
                        _permit: permit,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to connect to {}: {}", inner.endpoint, e);
                }
                Err(_) => {
                    tracing::warn!("Failed to connect to {}: timed out", inner.endpoint);
                }
            }
        }

        Err(TransportError::ConnectFailed {
            attempts: inner.retry_policy.max_attempts(),
        }
        .into())
    }

    /// Returns a connection to the pool. An open connection goes back on the
    /// idle stack; a closed one frees its slot empty.
    pub fn release(&self, mut conn: PooledConnection) {
        if let Some(tracked) = conn.tracked.take() {
            if tracked.connection.is_open() {
                self.inner.idle.lock().push(tracked);
            } else {
                tracing::debug!(
                    "[conn {}] released closed connection",
                    tracked.connection.id()
                );
            }
        }
    }

    /// Runs `f` with a checked-out connection and always releases it.
    ///
    /// Protocol, transport and application-exception errors close the
    /// connection and are returned as is. Socket timeouts close it and become
    /// [`TransportError::TimedOut`]; other socket errors close it and become
    /// [`TransportError::Unknown`]. Any other error leaves it reusable.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, ClientError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T, ClientError>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut *conn).await;
        let result = match result {
            Ok(value) => Ok(value),
            Err(err) => Err(dispose_on_error(&mut *conn, err).await),
        };
        self.release(conn);
        result
    }
}

async fn dispose_on_error(conn: &mut Connection, err: ClientError) -> ClientError {
    if !err.poisons_connection() {
        return err;
    }
    conn.close().await;
    match err {
        ClientError::Io(e) => match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::TimedOut.into(),
            _ => TransportError::Unknown(e.to_string()).into(),
        },
        err => err,
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("size", &self.inner.config.size)
            .field("live", &self.live_connections())
            .finish()
    }
}
