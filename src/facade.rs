/// Single entry point for application handlers
///
/// `DataAccess` composes the cache, router, pools, health monitor and timer.
/// Reads are served from the cache when possible and otherwise loaded from a
/// routed pool and cached. Writes always run on the primary and invalidate
/// cache prefixes only after the storage write succeeded.
use crate::cache::{BackendKind, CacheStore};
use crate::config::Config;
use crate::core::{Connector, OpKind, OperationFuture};
use crate::error::{DataError, DataResult};
use crate::health::{MonitorHandle, ReplicaHealthMonitor, ReplicaProbe, ReplicaSnapshot, ReplicaState};
use crate::pool::{ConnectionPool, PoolStats};
use crate::router::{QueryRouter, RoutingStats};
use crate::timer::QueryTimer;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-replica entry of a `HealthReport`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaReport {
    pub name: String,
    pub state: ReplicaState,
    /// Unix time of the last probe in milliseconds
    pub last_checked: Option<u64>,
    pub consecutive_failures: u32,
    pub replication_lag_ms: Option<u64>,
}

/// Point-in-time view of the layer for health endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub cache_backend: BackendKind,
    pub backend_degraded: bool,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub slow_queries: u64,
    pub replicas: Vec<ReplicaReport>,
    pub pools: Vec<PoolStats>,
    pub routing: RoutingStats,
}

pub struct DataAccess<K: Connector> {
    router: QueryRouter<K>,
    cache: CacheStore,
    timer: QueryTimer,
    monitor: Arc<ReplicaHealthMonitor>,
    monitor_task: Mutex<Option<MonitorHandle>>,
}

impl<K: Connector> DataAccess<K> {
    /// Build the layer: pools, cache backend, one probe round, then the monitor task
    pub async fn connect(config: &Config, connector: K) -> DataResult<Self> {
        config.validate()?;
        let cache = CacheStore::connect(&config.cache).await;
        Self::with_cache(config, connector, cache).await
    }

    /// Like `connect` with an already built cache store
    pub async fn with_cache(config: &Config, connector: K, cache: CacheStore) -> DataResult<Self> {
        config.validate()?;
        let connector = Arc::new(connector);

        let primary = Arc::new(ConnectionPool::new(
            config.primary_target(),
            Arc::clone(&connector),
        ));
        let replicas: Vec<Arc<ConnectionPool<K>>> = config
            .replica_targets()
            .into_iter()
            .map(|target| Arc::new(ConnectionPool::new(target, Arc::clone(&connector))))
            .collect();

        let probes = replicas
            .iter()
            .map(|pool| Arc::clone(pool) as Arc<dyn ReplicaProbe>)
            .collect();
        let monitor = Arc::new(ReplicaHealthMonitor::new(probes, config.health.policy()));

        let monitor_task = if replicas.is_empty() {
            None
        } else {
            let snapshot = monitor.probe_once().await;
            info!(
                replicas = replicas.len(),
                healthy = snapshot.healthy_count(),
                "Initial replica probe complete"
            );
            Some(monitor.spawn())
        };

        let router = QueryRouter::new(
            primary,
            replicas,
            monitor.subscribe(),
            config.routing.strategy,
        );

        info!(
            primary = %config.primary.name,
            replicas = config.replicas.len(),
            cache_backend = %cache.backend_kind(),
            "Data access layer ready"
        );

        Ok(Self {
            router,
            cache,
            timer: QueryTimer::new(config.timer.warn_threshold()),
            monitor,
            monitor_task: Mutex::new(monitor_task),
        })
    }

    /// Read-through: serve `key` from the cache or load it on a routed connection
    pub async fn read<T, F>(&self, key: &str, ttl: Duration, loader: F) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> FnOnce(&'c mut K::Connection) -> OperationFuture<'c, T> + Send,
    {
        self.read_through(key, ttl, false, loader).await
    }

    /// Like `read`, but a miss is loaded from the primary
    pub async fn read_from_primary<T, F>(&self, key: &str, ttl: Duration, loader: F) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> FnOnce(&'c mut K::Connection) -> OperationFuture<'c, T> + Send,
    {
        self.read_through(key, ttl, true, loader).await
    }

    async fn read_through<T, F>(
        &self,
        key: &str,
        ttl: Duration,
        force_primary: bool,
        loader: F,
    ) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> FnOnce(&'c mut K::Connection) -> OperationFuture<'c, T> + Send,
    {
        if let Some(cached) = self.cache.get(key).await {
            match serde_json::from_slice::<T>(&cached) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(key, "Discarding undecodable cached value: {}", e);
                    self.cache.discard(key).await;
                }
            }
        }

        let label = format!("read:{}", key);
        let value = self
            .timer
            .time(&label, async move {
                let route = if force_primary {
                    self.router.route_primary()
                } else {
                    self.router.route(OpKind::Read)
                };
                debug!(key, pool = %route.target, fallback = route.fallback, "Loading on cache miss");
                route.pool.execute(loader).await
            })
            .await?;

        let encoded = serde_json::to_vec(&value).map_err(DataError::Serialization)?;
        self.cache.set(key, Bytes::from(encoded), ttl).await;
        Ok(value)
    }

    /// Run `loader` on the primary, then invalidate each prefix if it succeeded
    pub async fn write<T, F>(&self, loader: F, invalidate_prefixes: &[&str]) -> DataResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut K::Connection) -> OperationFuture<'c, T> + Send,
    {
        let value = self
            .timer
            .time("write", async move {
                let route = self.router.route(OpKind::Write);
                route.pool.execute(loader).await
            })
            .await?;

        for prefix in invalidate_prefixes {
            self.cache.invalidate_prefix(prefix).await;
        }
        Ok(value)
    }

    /// Run one replica probe round now instead of waiting for the next interval
    pub async fn probe_replicas(&self) -> Arc<ReplicaSnapshot> {
        self.monitor.probe_once().await
    }

    pub fn health(&self) -> HealthReport {
        let cache = self.cache.stats();
        let snapshot = self.router.snapshot();

        let replicas = snapshot
            .replicas()
            .iter()
            .map(|status| ReplicaReport {
                name: status.target_name.clone(),
                state: status.state,
                last_checked: status
                    .last_checked
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64),
                consecutive_failures: status.consecutive_failures,
                replication_lag_ms: status.replication_lag.map(|lag| lag.as_millis() as u64),
            })
            .collect();

        HealthReport {
            cache_backend: cache.backend,
            backend_degraded: cache.backend_degraded,
            hits: cache.hits,
            misses: cache.misses,
            invalidations: cache.invalidations,
            slow_queries: self.timer.slow_queries(),
            replicas,
            pools: self.router.pools().map(|pool| pool.stats()).collect(),
            routing: self.router.routing_stats(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn router(&self) -> &QueryRouter<K> {
        &self.router
    }

    pub fn timer(&self) -> &QueryTimer {
        &self.timer
    }

    /// Stop the health monitor and close every pool
    pub async fn close(&self) {
        if let Some(mut handle) = self.monitor_task.lock().await.take() {
            handle.shutdown().await;
        }
        self.router.close();
        info!("Data access layer closed");
    }
}
