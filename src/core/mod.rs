/// Core abstractions shared by the pool, router and health monitor
pub mod connection;
pub mod dsn;

use crate::error::DataResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Role of a physical database endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// The single writable target
    Primary,
    /// Read-only asynchronous mirror of the primary
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Read/write classification of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// Description of one physical database endpoint
#[derive(Debug, Clone)]
pub struct PoolTarget {
    pub name: String,
    pub role: Role,
    pub dsn: String,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long `acquire` waits for a free slot before `PoolExhausted`
    pub acquire_timeout: Duration,
    /// Idle connections older than this are pinged before reuse
    pub recycle_after: Duration,
}

impl PoolTarget {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_RECYCLE_AFTER: Duration = Duration::from_secs(120);

    pub fn new<N: Into<String>, D: Into<String>>(name: N, role: Role, dsn: D) -> Self {
        Self {
            name: name.into(),
            role,
            dsn: dsn.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            command_timeout: Self::DEFAULT_COMMAND_TIMEOUT,
            acquire_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            recycle_after: Self::DEFAULT_RECYCLE_AFTER,
        }
    }

    pub fn primary<N: Into<String>, D: Into<String>>(name: N, dsn: D) -> Self {
        Self::new(name, Role::Primary, dsn)
    }

    pub fn replica<N: Into<String>, D: Into<String>>(name: N, dsn: D) -> Self {
        Self::new(name, Role::Replica, dsn)
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_recycle_after(mut self, interval: Duration) -> Self {
        self.recycle_after = interval;
        self
    }
}

/// A live connection to one database endpoint
#[async_trait]
pub trait Connection: Send + 'static {
    /// Lightweight liveness check (a trivial no-op query)
    async fn ping(&mut self) -> DataResult<()>;

    /// Estimated replication lag, for backends able to report it
    async fn replication_lag(&mut self) -> DataResult<Option<Duration>> {
        Ok(None)
    }
}

/// Opens connections for a pool target.
///
/// Implemented by the storage driver; the layer itself never interprets the DSN
/// beyond handing it over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, target: &PoolTarget) -> DataResult<Self::Connection>;
}

/// Boxed future returned by a loader borrowing a pooled connection
pub type OperationFuture<'c, T> = BoxFuture<'c, DataResult<T>>;
