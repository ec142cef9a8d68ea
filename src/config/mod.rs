//! # Configuration System
//!
//! Serde-backed configuration for every subsystem, with defaults matching the
//! documented operational envelope (pool 10..50, 10s probes, 60s windows) and
//! an environment-aware YAML loader in [`loader`]. Configuration is loaded
//! once, validated, and passed by reference into each component; nothing in
//! this crate reads global state after construction.

pub mod loader;

pub use loader::ConfigManager;

use crate::error::{DbAccessError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the resilience core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DbAccessConfig {
    pub instances: InstancesConfig,
    pub pool: PoolSettings,
    pub health: HealthSettings,
    pub routing: RoutingSettings,
    pub circuit_breaker: BreakerSettings,
    pub cache: CacheSettings,
    pub rate_limiter: LimiterSettings,
}

impl DbAccessConfig {
    /// Validate cross-field consistency. Rejects configurations that would
    /// make a subsystem degenerate (zero-sized pool, empty windows, and so
    /// on) instead of failing later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.instances.primary.id.is_empty() || self.instances.primary.endpoint.is_empty() {
            return Err(DbAccessError::Configuration(
                "primary instance requires an id and endpoint".into(),
            ));
        }
        for replica in &self.instances.replicas {
            if replica.id.is_empty() || replica.endpoint.is_empty() {
                return Err(DbAccessError::Configuration(
                    "replica instances require an id and endpoint".into(),
                ));
            }
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(DbAccessError::Configuration(format!(
                "pool min_connections ({}) exceeds max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.pool.max_connections == 0 {
            return Err(DbAccessError::Configuration(
                "pool max_connections must be positive".into(),
            ));
        }
        if self.health.probe_interval_ms == 0 {
            return Err(DbAccessError::Configuration(
                "health probe_interval_ms must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.failure_rate_threshold)
            || self.circuit_breaker.failure_rate_threshold == 0.0
        {
            return Err(DbAccessError::Configuration(
                "circuit_breaker failure_rate_threshold must be in (0, 1]".into(),
            ));
        }
        if self.cache.l1_capacity == 0 {
            return Err(DbAccessError::Configuration(
                "cache l1_capacity must be positive".into(),
            ));
        }
        if self.rate_limiter.window_secs == 0
            || self.rate_limiter.per_user_limit == 0
            || self.rate_limiter.global_limit == 0
        {
            return Err(DbAccessError::Configuration(
                "rate_limiter window and limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Static cluster topology: one primary plus any number of replicas.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstancesConfig {
    pub primary: InstanceConfig,
    pub replicas: Vec<InstanceConfig>,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            primary: InstanceConfig {
                id: "primary".to_string(),
                endpoint: "postgresql://localhost:5432/app".to_string(),
            },
            replicas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub id: String,
    pub endpoint: String,
}

/// Connection pool bounds and lifetimes (one pool per role).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 10,
            max_connections: 50,
            acquire_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            max_lifetime_secs: 3_600,
            sweep_interval_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Health monitor cadence and classification thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// An instance with no successful probe for this long is UNHEALTHY even
    /// if individual probes are merely erroring out.
    pub stale_after_ms: u64,
    pub degraded_cpu_percent: f64,
    pub degraded_lag_secs: f64,
    pub unhealthy_cpu_percent: f64,
    pub unhealthy_lag_secs: f64,
    pub unhealthy_memory_percent: f64,
    pub unhealthy_disk_percent: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            stale_after_ms: 30_000,
            degraded_cpu_percent: 80.0,
            degraded_lag_secs: 5.0,
            unhealthy_cpu_percent: 95.0,
            unhealthy_lag_secs: 30.0,
            unhealthy_memory_percent: 95.0,
            unhealthy_disk_percent: 90.0,
        }
    }
}

impl HealthSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Read-routing policy knobs owned by the workload isolator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Reads go to a replica only when its last reported lag is below this.
    pub replica_lag_threshold_secs: f64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            replica_lag_threshold_secs: 5.0,
        }
    }
}

/// Per-role circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub window_ms: u64,
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the failure rate is trusted.
    pub minimum_samples: u32,
    pub open_cooldown_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            failure_rate_threshold: 0.5,
            minimum_samples: 10,
            open_cooldown_ms: 30_000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Two-tier cache sizing and TTLs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub l1_capacity: usize,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_capacity: 1_000,
            l1_ttl_secs: 60,
            l2_ttl_secs: 300,
        }
    }
}

impl CacheSettings {
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }
}

/// Sliding-window admission limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimiterSettings {
    pub window_secs: u64,
    pub per_user_limit: u32,
    pub global_limit: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            per_user_limit: 100,
            global_limit: 10_000,
        }
    }
}

impl LimiterSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
