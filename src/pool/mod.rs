/// Bounded connection pool for a single database endpoint
///
/// A semaphore bounds the number of live connections (idle + in use). Idle
/// connections are kept in LIFO order and pinged before reuse once they have
/// been idle longer than the target's `recycle_after`. A connection that was
/// mid-operation when its future was dropped, or whose operation timed out, is
/// discarded instead of being returned: its protocol state is unknown.
use crate::core::{Connection, Connector, OperationFuture, PoolTarget, Role};
use crate::error::{DataError, DataResult};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Snapshot of pool occupancy and lifetime counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub role: Role,
    pub max_connections: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened: u64,
    pub discarded: u64,
}

/// Result of a liveness probe against a pool's endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub replication_lag: Option<Duration>,
}

/// Connection pool wrapping one physical endpoint
pub struct ConnectionPool<K: Connector> {
    target: PoolTarget,
    connector: Arc<K>,
    shared: Arc<PoolShared<K::Connection>>,
}

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct PoolShared<C> {
    target_name: String,
    idle: Mutex<Vec<IdleConnection<C>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl<C> PoolShared<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection<C>>> {
        // A panic while holding the lock cannot leave the Vec inconsistent
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn discard(&self, reason: &str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.target_name, reason, "Discarding connection");
    }
}

/// A connection checked out of a pool.
///
/// Dropping it returns the connection to the idle set, unless it was marked
/// for discard or the pool has been closed.
pub struct PooledConnection<C> {
    conn: Option<C>,
    shared: Arc<PoolShared<C>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C> PooledConnection<C> {
    /// Drop the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        // Runs before `_permit` is released, so a waiter woken by the permit
        // finds this connection already idle.
        if let Some(conn) = self.conn.take() {
            if self.discard {
                self.shared.discard("marked for discard");
            } else if self.shared.closed.load(Ordering::Acquire) {
                self.shared.discard("pool closed");
            } else {
                self.shared.idle().push(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            }
        }
    }
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(target: PoolTarget, connector: Arc<K>) -> Self {
        let shared = Arc::new(PoolShared {
            target_name: target.name.clone(),
            idle: Mutex::new(Vec::with_capacity(target.max_connections)),
            permits: Arc::new(Semaphore::new(target.max_connections)),
            closed: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        Self {
            target,
            connector,
            shared,
        }
    }

    pub fn target(&self) -> &PoolTarget {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Check out a connection, waiting up to `acquire_timeout` for a free slot
    pub async fn acquire(&self) -> DataResult<PooledConnection<K::Connection>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(DataError::closed(&self.target.name));
        }

        let wait = self.target.acquire_timeout;
        let permit = match timeout(wait, Arc::clone(&self.shared.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DataError::closed(&self.target.name)),
            Err(_) => {
                warn!(
                    pool = %self.target.name,
                    waited_ms = wait.as_millis() as u64,
                    "Connection pool exhausted"
                );
                return Err(DataError::pool_exhausted(&self.target.name, wait));
            }
        };

        let conn = self.checkout().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            discard: false,
            _permit: permit,
        })
    }

    /// Return a connection to the idle set
    pub fn release(&self, conn: PooledConnection<K::Connection>) {
        drop(conn);
    }

    /// Run `operation` on a pooled connection, bounded by `command_timeout`
    pub async fn execute<T, F>(&self, operation: F) -> DataResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut K::Connection) -> OperationFuture<'c, T> + Send,
    {
        let mut conn = self.acquire().await?;

        // Stays set if this future is dropped mid-operation
        conn.discard = true;

        let limit = self.target.command_timeout;
        let outcome = timeout(limit, operation(&mut *conn)).await;
        match outcome {
            Ok(Ok(value)) => {
                conn.discard = false;
                Ok(value)
            }
            Ok(Err(error)) => {
                // A rejected query leaves the protocol state intact
                conn.discard = !matches!(error, DataError::Query { .. });
                Err(error)
            }
            Err(_) => {
                warn!(
                    pool = %self.target.name,
                    limit_ms = limit.as_millis() as u64,
                    "Command timeout, discarding connection"
                );
                Err(DataError::timeout(&self.target.name, "execute", limit))
            }
        }
    }

    /// Liveness probe: ping a connection and sample replication lag.
    ///
    /// Never waits for a request slot. When every slot is checked out the
    /// endpoint is checked on a dedicated connection that is closed afterwards,
    /// so a saturated pool is not mistaken for a dead endpoint.
    pub async fn probe(&self) -> DataResult<ProbeOutcome> {
        if self.is_closed() {
            return Err(DataError::closed(&self.target.name));
        }

        match Arc::clone(&self.shared.permits).try_acquire_owned() {
            Ok(permit) => {
                let mut conn = PooledConnection {
                    conn: Some(self.checkout().await?),
                    shared: Arc::clone(&self.shared),
                    discard: true,
                    _permit: permit,
                };
                let outcome = self.check_liveness(&mut conn).await?;
                conn.discard = false;
                Ok(outcome)
            }
            Err(TryAcquireError::Closed) => Err(DataError::closed(&self.target.name)),
            Err(TryAcquireError::NoPermits) => {
                debug!(pool = %self.target.name, "Pool saturated, probing on a dedicated connection");
                let mut conn = self.open().await?;
                let outcome = self.check_liveness(&mut conn).await;
                self.shared.discard("probe connection");
                outcome
            }
        }
    }

    async fn check_liveness(&self, conn: &mut K::Connection) -> DataResult<ProbeOutcome> {
        let limit = self.target.command_timeout;
        timeout(limit, conn.ping())
            .await
            .map_err(|_| DataError::timeout(&self.target.name, "ping", limit))??;

        let replication_lag = match timeout(limit, conn.replication_lag()).await {
            Ok(Ok(lag)) => lag,
            Ok(Err(e)) => {
                debug!(pool = %self.target.name, "Replication lag unavailable: {}", e);
                None
            }
            Err(_) => None,
        };

        Ok(ProbeOutcome { replication_lag })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle().len();
        let available = self.shared.permits.available_permits();
        PoolStats {
            name: self.target.name.clone(),
            role: self.target.role,
            max_connections: self.target.max_connections,
            idle,
            in_use: self.target.max_connections.saturating_sub(available),
            opened: self.shared.opened.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Close the pool: idle connections are dropped now, checked-out ones on return
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();
        let drained: Vec<_> = self.shared.idle().drain(..).collect();
        debug!(pool = %self.target.name, idle = drained.len(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Reuse an idle connection (validating stale ones) or open a new one
    async fn checkout(&self) -> DataResult<K::Connection> {
        loop {
            let candidate = self.shared.idle().pop();
            let Some(idle) = candidate else {
                return self.open().await;
            };

            if idle.idle_since.elapsed() < self.target.recycle_after {
                return Ok(idle.conn);
            }

            let mut conn = idle.conn;
            match timeout(self.target.command_timeout, conn.ping()).await {
                Ok(Ok(())) => return Ok(conn),
                Ok(Err(e)) => {
                    debug!(pool = %self.target.name, "Stale connection failed validation: {}", e);
                    self.shared.discard("failed validation");
                }
                Err(_) => self.shared.discard("validation timed out"),
            }
        }
    }

    async fn open(&self) -> DataResult<K::Connection> {
        let limit = self.target.connect_timeout;
        let conn = timeout(limit, self.connector.connect(&self.target))
            .await
            .map_err(|_| DataError::timeout(&self.target.name, "connect", limit))??;

        let opened = self.shared.opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pool = %self.target.name, opened, "Opened connection");
        Ok(conn)
    }
}
