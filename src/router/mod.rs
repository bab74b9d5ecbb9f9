/// Primary/replica query routing
///
/// Writes always go to the primary. Reads go to a HEALTHY replica picked by the
/// configured selection policy, or to the primary when no replica is healthy.
/// Replica health is read from the monitor's latest snapshot on every decision.
pub mod balancer;

use crate::core::{Connector, OpKind};
use crate::health::ReplicaSnapshot;
use crate::pool::ConnectionPool;
use balancer::{SelectionPolicy, SelectionStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// A routing decision
pub struct Route<K: Connector> {
    pub target: String,
    pub pool: Arc<ConnectionPool<K>>,
    /// Read sent to the primary because no replica was healthy
    pub fallback: bool,
}

/// Per-target routing counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingStats {
    pub routed: BTreeMap<String, u64>,
    pub fallbacks: u64,
}

pub struct QueryRouter<K: Connector> {
    primary: Arc<ConnectionPool<K>>,
    replicas: Vec<Arc<ConnectionPool<K>>>,
    status: watch::Receiver<Arc<ReplicaSnapshot>>,
    policy: Box<dyn SelectionPolicy>,
    routed: HashMap<String, AtomicU64>,
    fallbacks: AtomicU64,
    in_fallback: AtomicBool,
}

impl<K: Connector> QueryRouter<K> {
    pub fn new(
        primary: Arc<ConnectionPool<K>>,
        replicas: Vec<Arc<ConnectionPool<K>>>,
        status: watch::Receiver<Arc<ReplicaSnapshot>>,
        strategy: SelectionStrategy,
    ) -> Self {
        let routed = std::iter::once(&primary)
            .chain(replicas.iter())
            .map(|pool| (pool.name().to_string(), AtomicU64::new(0)))
            .collect();

        debug!(
            primary = primary.name(),
            replicas = replicas.len(),
            %strategy,
            "Query router created"
        );

        Self {
            primary,
            replicas,
            status,
            policy: strategy.build(),
            routed,
            fallbacks: AtomicU64::new(0),
            in_fallback: AtomicBool::new(false),
        }
    }

    /// Pick the pool for an operation of the given kind
    pub fn route(&self, kind: OpKind) -> Route<K> {
        match kind {
            OpKind::Write => self.route_primary(),
            OpKind::Read => self.route_read(),
        }
    }

    /// Explicit primary routing, for reads that must observe a preceding write
    pub fn route_primary(&self) -> Route<K> {
        self.to(&self.primary, false)
    }

    fn route_read(&self) -> Route<K> {
        if self.replicas.is_empty() {
            return self.to(&self.primary, false);
        }

        let snapshot = self.snapshot();
        let healthy: Vec<&Arc<ConnectionPool<K>>> = self
            .replicas
            .iter()
            .filter(|pool| snapshot.is_routable(pool.name()))
            .collect();

        match self.policy.select(healthy.len()) {
            Some(index) => {
                if self.in_fallback.swap(false, Ordering::AcqRel) {
                    info!(
                        healthy = healthy.len(),
                        "Healthy replica available again, resuming replica reads"
                    );
                }
                self.to(healthy[index], false)
            }
            None => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                if !self.in_fallback.swap(true, Ordering::AcqRel) {
                    info!(
                        replicas = self.replicas.len(),
                        "All replicas unhealthy, routing reads to primary"
                    );
                }
                self.to(&self.primary, true)
            }
        }
    }

    fn to(&self, pool: &Arc<ConnectionPool<K>>, fallback: bool) -> Route<K> {
        if let Some(counter) = self.routed.get(pool.name()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Route {
            target: pool.name().to_string(),
            pool: Arc::clone(pool),
            fallback,
        }
    }

    /// Latest replica health snapshot
    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        Arc::clone(&self.status.borrow())
    }

    pub fn routing_stats(&self) -> RoutingStats {
        RoutingStats {
            routed: self
                .routed
                .iter()
                .map(|(name, count)| (name.clone(), count.load(Ordering::Relaxed)))
                .collect(),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn primary(&self) -> &Arc<ConnectionPool<K>> {
        &self.primary
    }

    pub fn replicas(&self) -> &[Arc<ConnectionPool<K>>] {
        &self.replicas
    }

    /// Primary first, then replicas in configuration order
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ConnectionPool<K>>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    pub fn close(&self) {
        for pool in self.pools() {
            pool.close();
        }
    }
}
