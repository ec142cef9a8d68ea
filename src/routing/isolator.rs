//! Workload classification and the fallback-to-primary policy.

use super::ReplicaBalancer;
use crate::config::RoutingSettings;
use crate::health::HealthRegistry;
use crate::types::Role;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryClass {
    Read,
    Write,
}

/// Caller-declared priority. Critical reads pin to the primary to dodge
/// replication lag entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Critical,
}

/// Why a read that could have used a replica went to the primary instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoHealthyReplica,
    ReplicaLagging,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub role: Role,
    pub class: QueryClass,
    pub fallback: Option<FallbackReason>,
}

/// Classify a statement by its leading keyword, before any I/O. Anything
/// unrecognized counts as a write: routing an exotic statement to the
/// primary is always safe, the reverse is not.
pub fn classify(sql: &str) -> QueryClass {
    let keyword = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match keyword.as_str() {
        "select" | "with" | "show" | "explain" | "values" | "table" => QueryClass::Read,
        _ => QueryClass::Write,
    }
}

/// Routes each query to the primary or a replica. Owns the lag-threshold
/// fallback policy; the balancer only ranks replicas.
pub struct WorkloadIsolator {
    registry: Arc<HealthRegistry>,
    balancer: Arc<ReplicaBalancer>,
    lag_threshold_secs: f64,
}

impl WorkloadIsolator {
    pub fn new(
        registry: Arc<HealthRegistry>,
        balancer: Arc<ReplicaBalancer>,
        settings: &RoutingSettings,
    ) -> Self {
        Self {
            registry,
            balancer,
            lag_threshold_secs: settings.replica_lag_threshold_secs,
        }
    }

    pub fn route(&self, sql: &str, priority: Priority) -> RouteDecision {
        let class = classify(sql);
        if class == QueryClass::Write || priority == Priority::Critical {
            return RouteDecision {
                role: Role::Primary,
                class,
                fallback: None,
            };
        }

        match self.balancer.select() {
            Ok(replica) => {
                // The balancer already filtered on health; lag is this
                // policy's call, based on the most recent reported value.
                let lag = self
                    .registry
                    .replica(&replica.id)
                    .map(|info| info.replication_lag_secs)
                    .unwrap_or(replica.replication_lag_secs);
                if lag < self.lag_threshold_secs {
                    RouteDecision {
                        role: Role::replica(replica.id),
                        class,
                        fallback: None,
                    }
                } else {
                    debug!(replica = %replica.id, lag, "replica lag over threshold, read falls back to primary");
                    RouteDecision {
                        role: Role::Primary,
                        class,
                        fallback: Some(FallbackReason::ReplicaLagging),
                    }
                }
            }
            Err(_) => {
                debug!("no healthy replica, read falls back to primary");
                RouteDecision {
                    role: Role::Primary,
                    class,
                    fallback: Some(FallbackReason::NoHealthyReplica),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbAccessConfig, InstanceConfig};
    use crate::health::HealthState;
    use proptest::prelude::*;

    #[test]
    fn leading_keyword_classification() {
        assert_eq!(classify("SELECT * FROM stories"), QueryClass::Read);
        assert_eq!(classify("  with cte AS (SELECT 1) SELECT 1"), QueryClass::Read);
        assert_eq!(classify("EXPLAIN SELECT 1"), QueryClass::Read);
        assert_eq!(classify("INSERT INTO stories VALUES (1)"), QueryClass::Write);
        assert_eq!(classify("UPDATE stories SET title = 'x'"), QueryClass::Write);
        assert_eq!(classify("DELETE FROM stories"), QueryClass::Write);
        assert_eq!(classify("TRUNCATE stories"), QueryClass::Write);
        assert_eq!(classify(""), QueryClass::Write);
    }

    proptest! {
        #[test]
        fn classification_is_total(sql in ".{0,200}") {
            // Never panics, always lands on one of the two classes.
            let _ = classify(&sql);
        }
    }

    fn isolator_with(replicas: &[(&str, f64, HealthState)]) -> (WorkloadIsolator, Arc<HealthRegistry>) {
        let mut config = DbAccessConfig::default();
        for (id, _, _) in replicas {
            config.instances.replicas.push(InstanceConfig {
                id: (*id).to_string(),
                endpoint: format!("db://{id}"),
            });
        }
        let registry = Arc::new(HealthRegistry::new(&config));
        for (id, lag, health) in replicas {
            registry.update_replica(id, |replica| {
                replica.replication_lag_secs = *lag;
                replica.health = *health;
            });
        }
        let balancer = Arc::new(ReplicaBalancer::new(Arc::clone(&registry)));
        (
            WorkloadIsolator::new(Arc::clone(&registry), balancer, &config.routing),
            registry,
        )
    }

    #[test]
    fn writes_always_route_to_primary() {
        let (isolator, _) = isolator_with(&[("r1", 0.0, HealthState::Healthy)]);
        let decision = isolator.route("INSERT INTO t VALUES (1)", Priority::Normal);
        assert_eq!(decision.role, Role::Primary);
        assert_eq!(decision.class, QueryClass::Write);
    }

    #[test]
    fn critical_reads_route_to_primary() {
        let (isolator, _) = isolator_with(&[("r1", 0.0, HealthState::Healthy)]);
        let decision = isolator.route("SELECT 1", Priority::Critical);
        assert_eq!(decision.role, Role::Primary);
        assert_eq!(decision.class, QueryClass::Read);
    }

    #[test]
    fn fresh_replica_serves_ordinary_reads() {
        let (isolator, _) = isolator_with(&[("r1", 1.0, HealthState::Healthy)]);
        let decision = isolator.route("SELECT 1", Priority::Normal);
        assert_eq!(decision.role, Role::replica("r1"));
        assert!(decision.fallback.is_none());
    }

    #[test]
    fn lagging_replica_falls_back_to_primary() {
        let (isolator, _) = isolator_with(&[("r1", 7.5, HealthState::Healthy)]);
        let decision = isolator.route("SELECT 1", Priority::Normal);
        assert_eq!(decision.role, Role::Primary);
        assert_eq!(decision.fallback, Some(FallbackReason::ReplicaLagging));
    }

    #[test]
    fn no_replica_falls_back_to_primary() {
        let (isolator, _) = isolator_with(&[]);
        let decision = isolator.route("SELECT 1", Priority::Normal);
        assert_eq!(decision.role, Role::Primary);
        assert_eq!(decision.fallback, Some(FallbackReason::NoHealthyReplica));
    }

    #[test]
    fn lag_recovery_restores_replica_routing() {
        let (isolator, registry) = isolator_with(&[("r1", 9.0, HealthState::Healthy)]);
        assert_eq!(
            isolator.route("SELECT 1", Priority::Normal).role,
            Role::Primary
        );
        registry.update_replica("r1", |replica| replica.replication_lag_secs = 0.5);
        assert_eq!(
            isolator.route("SELECT 1", Priority::Normal).role,
            Role::replica("r1")
        );
    }
}
