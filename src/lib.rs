/// Estrada - data-access routing layer for CRUD services
///
/// Sits between application handlers and the persistence tier:
/// 1. Read-through caching with TTL and prefix invalidation (Redis, or an in-process map when Redis is down)
/// 2. Primary/replica routing with automatic failover driven by a background health monitor
/// 3. Slow-query warnings from wall-clock timing of every routed operation
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod facade;
pub mod health;
pub mod pool;
pub mod router;
pub mod timer;

#[cfg(test)]
mod testing;

pub use crate::cache::{BackendKind, CacheStats, CacheStore};
pub use crate::config::Config;
pub use crate::core::connection::TcpConnector;
pub use crate::core::{Connection, Connector, OpKind, OperationFuture, PoolTarget, Role};
pub use crate::error::{DataError, DataResult};
pub use crate::facade::{DataAccess, HealthReport};
pub use crate::health::{ReplicaState, ReplicaStatus};
pub use crate::timer::QueryTimer;
