/// Configuration management for estrada
use crate::core::PoolTarget;
use crate::health::HealthPolicy;
use crate::router::balancer::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main estrada configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The single writable database
    pub primary: TargetConfig,
    /// Read replicas, in routing order
    #[serde(default)]
    pub replicas: Vec<TargetConfig>,
    /// Pool defaults applied to every target
    #[serde(default)]
    pub pool: PoolConfig,
    /// Replica health probing
    #[serde(default)]
    pub health: HealthConfig,
    /// Read routing
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Read cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Slow-query observation
    #[serde(default)]
    pub timer: TimerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One physical database endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique target name used in logs, stats and routing
    pub name: String,
    /// Connection string handed to the connector
    pub dsn: String,
    /// Overrides `pool.max_connections` for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections per target
    pub max_connections: usize,
    /// Connection open timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-operation timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Queue timeout when the pool is exhausted, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Idle time after which a connection is pinged before reuse, in seconds
    pub recycle_after_sec: u64,
}

/// Replica health configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe interval in seconds
    pub probe_interval_sec: u64,
    /// Probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Number of consecutive failures before marking a replica DEAD
    pub dead_threshold: u32,
    /// Replication lag above which a replica is DEGRADED, in milliseconds
    pub max_replication_lag_ms: u64,
}

/// Read routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Replica selection strategy (round_robin, random)
    pub strategy: SelectionStrategy,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL; the in-process cache is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Prefix added to every Redis key
    pub key_namespace: String,
    /// Redis connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Redis command timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Upper bound for entry TTLs in seconds
    pub max_ttl_sec: u64,
    /// Capacity of the in-process cache
    pub max_entries: usize,
}

/// Slow-query observation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Operations slower than this are logged, in milliseconds
    pub warn_threshold_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: PoolTarget::DEFAULT_MAX_CONNECTIONS,
            connect_timeout_ms: PoolTarget::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            command_timeout_ms: PoolTarget::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            acquire_timeout_ms: PoolTarget::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            recycle_after_sec: PoolTarget::DEFAULT_RECYCLE_AFTER.as_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        let policy = HealthPolicy::default();
        Self {
            probe_interval_sec: policy.probe_interval.as_secs(),
            probe_timeout_ms: policy.probe_timeout.as_millis() as u64,
            dead_threshold: policy.dead_threshold,
            max_replication_lag_ms: policy.max_replication_lag.as_millis() as u64,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_namespace: "estrada:".to_string(),
            connect_timeout_ms: 2000,
            command_timeout_ms: 2000,
            max_ttl_sec: 3600,
            max_entries: crate::cache::memory::DEFAULT_MAX_ENTRIES,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            warn_threshold_ms: crate::timer::DEFAULT_WARN_THRESHOLD.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary: TargetConfig {
                name: "primary".to_string(),
                dsn: "postgres://app@127.0.0.1:5432/app".to_string(),
                max_connections: None,
            },
            replicas: Vec::new(),
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            cache: CacheConfig::default(),
            timer: TimerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PoolConfig {
    fn target(&self, target: &TargetConfig, primary: bool) -> PoolTarget {
        let base = if primary {
            PoolTarget::primary(&target.name, &target.dsn)
        } else {
            PoolTarget::replica(&target.name, &target.dsn)
        };
        base.with_max_connections(target.max_connections.unwrap_or(self.max_connections))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_command_timeout(Duration::from_millis(self.command_timeout_ms))
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .with_recycle_after(Duration::from_secs(self.recycle_after_sec))
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            probe_interval: Duration::from_secs(self.probe_interval_sec),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            dead_threshold: self.dead_threshold,
            max_replication_lag: Duration::from_millis(self.max_replication_lag_ms),
        }
    }
}

impl CacheConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_sec)
    }
}

impl TimerConfig {
    pub fn warn_threshold(&self) -> Duration {
        Duration::from_millis(self.warn_threshold_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Pool target for the primary
    pub fn primary_target(&self) -> PoolTarget {
        self.pool.target(&self.primary, true)
    }

    /// Pool targets for the replicas, in configuration order
    pub fn replica_targets(&self) -> Vec<PoolTarget> {
        self.replicas
            .iter()
            .map(|replica| self.pool.target(replica, false))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate targets
        let mut names = HashSet::new();
        for target in std::iter::once(&self.primary).chain(self.replicas.iter()) {
            if target.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "target name cannot be empty".to_string(),
                ));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate target name: {}",
                    target.name
                )));
            }
            if target.dsn.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "dsn cannot be empty for target {}",
                    target.name
                )));
            }
            if target.max_connections == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "max_connections must be greater than 0 for target {}",
                    target.name
                )));
            }
        }

        // Validate pool config
        if self.pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "pool max_connections must be greater than 0".to_string(),
            ));
        }

        for (field, value) in [
            ("connect_timeout_ms", self.pool.connect_timeout_ms),
            ("command_timeout_ms", self.pool.command_timeout_ms),
            ("acquire_timeout_ms", self.pool.acquire_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pool {} must be greater than 0",
                    field
                )));
            }
        }

        // Validate health config
        if self.health.probe_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health probe_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.probe_timeout_ms >= self.health.probe_interval_sec.saturating_mul(1000) {
            return Err(ConfigError::ValidationError(
                "health probe_timeout_ms must be less than probe_interval_sec".to_string(),
            ));
        }

        if self.health.dead_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health dead_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate cache config
        if self.cache.max_ttl_sec == 0 {
            return Err(ConfigError::ValidationError(
                "cache max_ttl_sec must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache max_entries must be greater than 0".to_string(),
            ));
        }

        if self.cache.connect_timeout_ms == 0 || self.cache.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "cache timeouts must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.cache.redis_url {
            crate::core::dsn::Dsn::parse(url)?;
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let target = |name: &str, host: &str| TargetConfig {
            name: name.to_string(),
            dsn: format!("postgres://app@{}:5432/app", host),
            max_connections: None,
        };

        let config = Config {
            primary: target("primary", "10.0.1.10"),
            replicas: vec![target("replica-1", "10.0.1.11"), target("replica-2", "10.0.1.12")],
            cache: CacheConfig {
                redis_url: Some("redis://10.0.1.20:6379/0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}
