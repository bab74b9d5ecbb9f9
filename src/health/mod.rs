/// Replica health monitoring
///
/// A single background task probes every replica pool on a fixed cadence and
/// publishes an immutable `ReplicaSnapshot` through a watch channel. The monitor
/// is the only writer; the router only ever reads the latest snapshot.
use crate::core::Connector;
use crate::error::DataResult;
use crate::pool::{ConnectionPool, ProbeOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Routing state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaState {
    /// Reachable and within the lag bound; eligible for reads
    Healthy,
    /// Reachable but lagging; excluded from reads, still probed
    Degraded,
    /// Failed `dead_threshold` consecutive probes; excluded from reads, still probed
    Dead,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Healthy => write!(f, "HEALTHY"),
            ReplicaState::Degraded => write!(f, "DEGRADED"),
            ReplicaState::Dead => write!(f, "DEAD"),
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    Healthy { replication_lag: Option<Duration> },
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Healthy { .. } => write!(f, "Healthy"),
            ProbeStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            ProbeStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl ProbeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeStatus::Healthy { .. })
    }
}

/// Health record of one replica
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaStatus {
    pub target_name: String,
    pub state: ReplicaState,
    pub last_checked: Option<SystemTime>,
    pub consecutive_failures: u32,
    pub replication_lag: Option<Duration>,
}

impl ReplicaStatus {
    /// Replicas start out HEALTHY until a probe says otherwise
    pub fn new<S: Into<String>>(target_name: S) -> Self {
        Self {
            target_name: target_name.into(),
            state: ReplicaState::Healthy,
            last_checked: None,
            consecutive_failures: 0,
            replication_lag: None,
        }
    }

    pub fn is_routable(&self) -> bool {
        self.state == ReplicaState::Healthy
    }

    /// Fold a probe result into this record
    fn apply(&mut self, probe: &ProbeStatus, policy: &HealthPolicy, now: SystemTime) {
        self.last_checked = Some(now);
        match probe {
            ProbeStatus::Healthy { replication_lag } => {
                self.consecutive_failures = 0;
                self.replication_lag = *replication_lag;
                self.state = match replication_lag {
                    Some(lag) if *lag > policy.max_replication_lag => ReplicaState::Degraded,
                    _ => ReplicaState::Healthy,
                };
            }
            ProbeStatus::Unhealthy { .. } | ProbeStatus::Timeout => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= policy.dead_threshold {
                    self.state = ReplicaState::Dead;
                }
            }
        }
    }
}

/// Immutable view of all replica records, replaced wholesale on every probe round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaSnapshot {
    replicas: Vec<ReplicaStatus>,
}

impl ReplicaSnapshot {
    pub fn new(replicas: Vec<ReplicaStatus>) -> Self {
        Self { replicas }
    }

    pub fn replicas(&self) -> &[ReplicaStatus] {
        &self.replicas
    }

    pub fn get(&self, name: &str) -> Option<&ReplicaStatus> {
        self.replicas.iter().find(|r| r.target_name == name)
    }

    /// Unknown replicas are never routable
    pub fn is_routable(&self, name: &str) -> bool {
        self.get(name).map(ReplicaStatus::is_routable).unwrap_or(false)
    }

    pub fn healthy_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_routable()).count()
    }
}

/// Probing cadence and state-transition thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub dead_threshold: u32,
    pub max_replication_lag: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(2),
            dead_threshold: 3,
            max_replication_lag: Duration::from_secs(5),
        }
    }
}

/// Something the monitor can probe
#[async_trait]
pub trait ReplicaProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> DataResult<ProbeOutcome>;
}

#[async_trait]
impl<K: Connector> ReplicaProbe for ConnectionPool<K> {
    fn name(&self) -> &str {
        ConnectionPool::name(self)
    }

    async fn probe(&self) -> DataResult<ProbeOutcome> {
        ConnectionPool::probe(self).await
    }
}

/// Background prober for the replica pools
pub struct ReplicaHealthMonitor {
    probes: Vec<Arc<dyn ReplicaProbe>>,
    policy: HealthPolicy,
    sender: watch::Sender<Arc<ReplicaSnapshot>>,
    // Serializes probe rounds so each one builds on the previous snapshot
    round: Mutex<()>,
}

impl ReplicaHealthMonitor {
    pub fn new(probes: Vec<Arc<dyn ReplicaProbe>>, policy: HealthPolicy) -> Self {
        let initial = probes
            .iter()
            .map(|p| ReplicaStatus::new(p.name()))
            .collect();
        let (sender, _) = watch::channel(Arc::new(ReplicaSnapshot::new(initial)));

        Self {
            probes,
            policy,
            sender,
            round: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Receiver for snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<Arc<ReplicaSnapshot>> {
        self.sender.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        Arc::clone(&self.sender.borrow())
    }

    /// Probe every replica once and publish the resulting snapshot
    pub async fn probe_once(&self) -> Arc<ReplicaSnapshot> {
        let _round = self.round.lock().await;

        let results = join_all(self.probes.iter().map(|p| self.run_probe(p.as_ref()))).await;

        let now = SystemTime::now();
        let mut next = (*self.snapshot()).clone();
        for (status, result) in next.replicas.iter_mut().zip(results.iter()) {
            let before = status.state;
            status.apply(result, &self.policy, now);
            log_transition(status, before, result);
        }

        let next = Arc::new(next);
        self.sender.send_replace(Arc::clone(&next));
        next
    }

    async fn run_probe(&self, probe: &dyn ReplicaProbe) -> ProbeStatus {
        match timeout(self.policy.probe_timeout, probe.probe()).await {
            Ok(Ok(outcome)) => ProbeStatus::Healthy {
                replication_lag: outcome.replication_lag,
            },
            Ok(Err(e)) => ProbeStatus::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => ProbeStatus::Timeout,
        }
    }

    /// Start the background probe loop; the first round runs one interval from now
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let monitor = Arc::clone(self);

        let task = tokio::spawn(async move {
            let period = monitor.policy.probe_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(
                replicas = monitor.probes.len(),
                interval_ms = period.as_millis() as u64,
                "Replica health monitor started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        monitor.probe_once().await;
                    }
                }
            }

            debug!("Replica health monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

fn log_transition(status: &ReplicaStatus, before: ReplicaState, result: &ProbeStatus) {
    let replica = status.target_name.as_str();
    match (before, status.state) {
        (ReplicaState::Dead, ReplicaState::Dead) => {}
        (_, ReplicaState::Dead) => warn!(
            replica,
            failures = status.consecutive_failures,
            "Replica marked DEAD: {}",
            result
        ),
        (ReplicaState::Degraded, ReplicaState::Degraded) => {}
        (_, ReplicaState::Degraded) => warn!(
            replica,
            lag_ms = status.replication_lag.map(|l| l.as_millis() as u64),
            "Replica marked DEGRADED: replication lag above bound"
        ),
        (ReplicaState::Healthy, ReplicaState::Healthy) => {
            if !result.is_healthy() {
                debug!(
                    replica,
                    failures = status.consecutive_failures,
                    "Replica probe failed: {}",
                    result
                );
            }
        }
        (_, ReplicaState::Healthy) => info!(replica, "Replica recovered, back to HEALTHY"),
    }
}

/// Handle to the running monitor task
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Replica health monitor ended abnormally: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
