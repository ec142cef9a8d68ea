//! # Health Monitoring
//!
//! Periodic per-instance probing, classification into
//! HEALTHY/DEGRADED/UNHEALTHY, and a shared read-only registry of the latest
//! [`HealthStatus`] and derived [`ReplicaInfo`] consumed by the load balancer
//! and workload isolator. Health flows one way out of this module; nothing
//! here reads breaker or pool state.

pub mod monitor;

pub use monitor::HealthMonitor;

use crate::config::DbAccessConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// All metrics within bounds.
    Healthy,
    /// Still usable but deprioritized (elevated CPU or lag).
    Degraded,
    /// Excluded from selection entirely.
    Unhealthy,
}

/// Latest observation for one instance. Published by the monitor, read-only
/// everywhere else.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub instance_id: String,
    pub checked_at: DateTime<Utc>,
    pub connected: bool,
    pub replication_lag_secs: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub response_time_ms: f64,
    pub verdict: HealthState,
}

/// Balancing view of one replica. The weight is derived by the monitor from
/// CPU, response-time baseline, and lag; callers never set it directly.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaInfo {
    pub id: String,
    pub endpoint: String,
    pub weight: u8,
    pub cpu_percent: f64,
    pub p95_response_ms: f64,
    pub replication_lag_secs: f64,
    pub health: HealthState,
}

/// Concurrent registry of health state, shared by reference with consumers.
pub struct HealthRegistry {
    statuses: DashMap<String, HealthStatus>,
    replicas: DashMap<String, ReplicaInfo>,
}

impl HealthRegistry {
    /// Seed from static topology: every replica starts selectable at full
    /// weight until the first probe says otherwise.
    pub fn new(config: &DbAccessConfig) -> Self {
        let replicas = DashMap::new();
        for replica in &config.instances.replicas {
            replicas.insert(
                replica.id.clone(),
                ReplicaInfo {
                    id: replica.id.clone(),
                    endpoint: replica.endpoint.clone(),
                    weight: 100,
                    cpu_percent: 0.0,
                    p95_response_ms: 0.0,
                    replication_lag_secs: 0.0,
                    health: HealthState::Healthy,
                },
            );
        }
        Self {
            statuses: DashMap::new(),
            replicas,
        }
    }

    pub fn status(&self, instance_id: &str) -> Option<HealthStatus> {
        self.statuses.get(instance_id).map(|s| s.clone())
    }

    pub fn statuses(&self) -> Vec<HealthStatus> {
        let mut all: Vec<HealthStatus> = self.statuses.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }

    pub fn replica(&self, replica_id: &str) -> Option<ReplicaInfo> {
        self.replicas.get(replica_id).map(|r| r.clone())
    }

    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        let mut all: Vec<ReplicaInfo> = self.replicas.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub(crate) fn publish(&self, status: HealthStatus) {
        self.statuses.insert(status.instance_id.clone(), status);
    }

    pub(crate) fn update_replica(&self, replica_id: &str, update: impl FnOnce(&mut ReplicaInfo)) {
        if let Some(mut replica) = self.replicas.get_mut(replica_id) {
            update(&mut replica);
        }
    }
}
