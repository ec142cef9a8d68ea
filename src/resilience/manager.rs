//! Per-role breaker registry with alert fan-out on Open transitions.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::backend::{AlertSeverity, AlertSink, MetricsSink};
use crate::error::Result;
use crate::types::Role;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

/// Owns one [`CircuitBreaker`] per database role, created lazily on first
/// use with a shared configuration.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<dyn MetricsSink>,
    breakers: DashMap<Role, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(
        config: CircuitBreakerConfig,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            alerts,
            metrics,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker_for(&self, role: &Role) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(role.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(role.to_string(), self.config.clone()))
            })
            .clone()
    }

    /// Run an operation through the breaker for `role`, raising a warning
    /// alert and counting the transition when this call trips the breaker
    /// open.
    pub async fn call_through<F, Fut, T>(&self, role: &Role, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker_for(role);
        let (result, opened) = breaker.call_with_transition(operation).await;
        if let Some(message) = opened {
            self.metrics.incr_counter(
                "circuit_breaker_opened",
                1,
                &[("breaker", role.to_string())],
            );
            self.alerts.notify(AlertSeverity::Warning, &message).await;
        }
        result
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<CircuitBreakerSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
