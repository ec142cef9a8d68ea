//! Weighted round-robin replica selection.

use crate::error::{DbAccessError, Result};
use crate::health::{HealthRegistry, HealthState, ReplicaInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Smooth weighted round-robin over the replicas the health registry
/// currently considers selectable (weight > 0 and not UNHEALTHY). Equal
/// weights rotate deterministically rather than concentrating on one
/// replica.
pub struct ReplicaBalancer {
    registry: Arc<HealthRegistry>,
    current: Mutex<HashMap<String, i64>>,
}

impl ReplicaBalancer {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self {
            registry,
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Pick a replica for a read, or `NoHealthyReplica` when none qualifies.
    pub fn select(&self) -> Result<ReplicaInfo> {
        // registry.replicas() is sorted by id, keeping tie-breaks stable.
        let candidates: Vec<ReplicaInfo> = self
            .registry
            .replicas()
            .into_iter()
            .filter(|replica| replica.health != HealthState::Unhealthy && replica.weight > 0)
            .collect();

        if candidates.is_empty() {
            return Err(DbAccessError::NoHealthyReplica);
        }

        let mut current = self.current.lock();
        let total: i64 = candidates.iter().map(|c| i64::from(c.weight)).sum();

        let mut best_index = 0;
        let mut best_score = i64::MIN;
        for (index, candidate) in candidates.iter().enumerate() {
            let score = current
                .entry(candidate.id.clone())
                .and_modify(|s| *s += i64::from(candidate.weight))
                .or_insert_with(|| i64::from(candidate.weight));
            if *score > best_score {
                best_score = *score;
                best_index = index;
            }
        }

        let winner = &candidates[best_index];
        if let Some(score) = current.get_mut(&winner.id) {
            *score -= total;
        }
        Ok(winner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbAccessConfig, InstanceConfig};

    fn registry_with(replicas: &[(&str, u8, HealthState)]) -> Arc<HealthRegistry> {
        let mut config = DbAccessConfig::default();
        for (id, _, _) in replicas {
            config.instances.replicas.push(InstanceConfig {
                id: (*id).to_string(),
                endpoint: format!("db://{id}"),
            });
        }
        let registry = Arc::new(HealthRegistry::new(&config));
        for (id, weight, health) in replicas {
            registry.update_replica(id, |replica| {
                replica.weight = *weight;
                replica.health = *health;
            });
        }
        registry
    }

    fn tally(balancer: &ReplicaBalancer, picks: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..picks {
            let replica = balancer.select().unwrap();
            *counts.entry(replica.id).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn equal_weights_rotate_evenly() {
        let registry = registry_with(&[
            ("r1", 100, HealthState::Healthy),
            ("r2", 100, HealthState::Healthy),
            ("r3", 100, HealthState::Healthy),
        ]);
        let balancer = ReplicaBalancer::new(registry);
        let counts = tally(&balancer, 9);
        assert_eq!(counts["r1"], 3);
        assert_eq!(counts["r2"], 3);
        assert_eq!(counts["r3"], 3);
    }

    #[test]
    fn selection_is_proportional_to_weight() {
        let registry = registry_with(&[
            ("r1", 100, HealthState::Healthy),
            ("r2", 50, HealthState::Healthy),
        ]);
        let balancer = ReplicaBalancer::new(registry);
        let counts = tally(&balancer, 30);
        assert_eq!(counts["r1"], 20);
        assert_eq!(counts["r2"], 10);
    }

    #[test]
    fn zero_weight_and_unhealthy_excluded() {
        let registry = registry_with(&[
            ("r1", 0, HealthState::Healthy),
            ("r2", 80, HealthState::Healthy),
            ("r3", 100, HealthState::Unhealthy),
        ]);
        let balancer = ReplicaBalancer::new(registry);
        for _ in 0..10 {
            assert_eq!(balancer.select().unwrap().id, "r2");
        }
    }

    #[test]
    fn empty_or_all_unhealthy_reports_no_replica() {
        let balancer = ReplicaBalancer::new(registry_with(&[]));
        assert!(matches!(
            balancer.select(),
            Err(DbAccessError::NoHealthyReplica)
        ));

        let registry = registry_with(&[("r1", 100, HealthState::Unhealthy)]);
        let balancer = ReplicaBalancer::new(registry);
        assert!(matches!(
            balancer.select(),
            Err(DbAccessError::NoHealthyReplica)
        ));
    }

    #[test]
    fn degraded_replicas_remain_selectable() {
        let registry = registry_with(&[("r1", 60, HealthState::Degraded)]);
        let balancer = ReplicaBalancer::new(registry);
        assert_eq!(balancer.select().unwrap().id, "r1");
    }
}
