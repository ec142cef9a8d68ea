//! # Database Gateway
//!
//! The composition root. Wires the pools, health monitor, balancer,
//! isolator, breakers, cache, and rate limiter into one `execute` entry
//! point that runs every request through the full control flow:
//! admission, cache lookup, routing, breaker-guarded execution, and
//! cache maintenance. Components stay independently testable; only this
//! module knows the order they compose in.

use crate::backend::{
    AlertSink, DatabaseConnector, DistributedStore, InstanceProbe, MetricsSink,
};
use crate::cache::CacheManager;
use crate::config::DbAccessConfig;
use crate::error::Result;
use crate::health::{HealthMonitor, HealthRegistry, HealthStatus, ReplicaInfo};
use crate::limiter::{RateLimiter, RequestScope};
use crate::pool::{PoolManager, PoolStats};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerSnapshot};
use crate::routing::{Priority, QueryClass, ReplicaBalancer, WorkloadIsolator};
use crate::types::Role;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External implementations the gateway is wired with.
pub struct GatewayBackends {
    pub connector: Arc<dyn DatabaseConnector>,
    pub store: Arc<dyn DistributedStore>,
    pub probe: Arc<dyn InstanceProbe>,
    pub alerts: Arc<dyn AlertSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Caching instructions attached to a read request.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub scope: RequestScope,
    pub priority: Priority,
    pub cache: Option<CachePolicy>,
    /// Tags to invalidate after this statement succeeds (writes only).
    pub invalidate_tags: Vec<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            scope: RequestScope::anonymous(),
            priority: Priority::Normal,
            cache: None,
            invalidate_tags: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: RequestScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cached(mut self, key: impl Into<String>, ttl: Option<Duration>, tags: &[&str]) -> Self {
        self.cache = Some(CachePolicy {
            key: key.into(),
            ttl,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        });
        self
    }

    pub fn invalidating(mut self, tags: &[&str]) -> Self {
        self.invalidate_tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub rows: Vec<Value>,
    pub rows_affected: u64,
    pub served_from_cache: bool,
    /// Which instance executed the statement; `None` on a cache hit.
    pub role: Option<Role>,
}

/// One facade over the whole resilience stack.
pub struct DatabaseGateway {
    pools: Arc<PoolManager>,
    registry: Arc<HealthRegistry>,
    isolator: WorkloadIsolator,
    breakers: CircuitBreakerManager,
    cache: CacheManager,
    limiter: RateLimiter,
    metrics: Arc<dyn MetricsSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatabaseGateway {
    /// Build and start the gateway: validates configuration, warms the
    /// pools to their floor, and spawns the health probes and pool
    /// maintenance loops.
    pub async fn new(config: DbAccessConfig, backends: GatewayBackends) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(HealthRegistry::new(&config));
        let pools = Arc::new(PoolManager::new(&config, Arc::clone(&backends.connector)));
        let balancer = Arc::new(ReplicaBalancer::new(Arc::clone(&registry)));
        let isolator = WorkloadIsolator::new(Arc::clone(&registry), balancer, &config.routing);
        let breakers = CircuitBreakerManager::new(
            CircuitBreakerConfig::from(&config.circuit_breaker),
            Arc::clone(&backends.alerts),
            Arc::clone(&backends.metrics),
        );
        let cache = CacheManager::new(
            config.cache.clone(),
            Arc::clone(&backends.store),
            Arc::clone(&backends.metrics),
        );
        let limiter = RateLimiter::new(
            config.rate_limiter.clone(),
            Arc::clone(&backends.store),
            Arc::clone(&backends.metrics),
        );

        // A cold cluster should not fail startup; the maintenance loop
        // keeps retrying the floor.
        if let Err(e) = pools.warm_all().await {
            warn!(error = %e, "initial pool warm incomplete, maintenance will retry");
        }

        let monitor = Arc::new(HealthMonitor::new(
            &config,
            Arc::clone(&backends.probe),
            Arc::clone(&backends.alerts),
            Arc::clone(&registry),
        ));
        let mut tasks = monitor.spawn();
        tasks.extend(pools.spawn_maintenance());
        tasks.push(Self::spawn_pool_gauges(
            Arc::clone(&pools),
            Arc::clone(&backends.metrics),
            config.health.probe_interval(),
        ));
        info!(
            replicas = config.instances.replicas.len(),
            "database gateway started"
        );

        Ok(Self {
            pools,
            registry,
            isolator,
            breakers,
            cache,
            limiter,
            metrics: backends.metrics,
            tasks: Mutex::new(tasks),
        })
    }

    /// Periodic pool gauges at the health-probe cadence.
    fn spawn_pool_gauges(
        pools: Arc<PoolManager>,
        metrics: Arc<dyn MetricsSink>,
        cadence: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for stats in pools.stats() {
                    let labels = [("role", stats.role.clone())];
                    metrics.record_gauge(
                        "pool_utilization_percent",
                        stats.utilization_percentage(),
                        &labels,
                    );
                    metrics.record_gauge(
                        "pool_idle_connections",
                        f64::from(stats.idle),
                        &labels,
                    );
                }
            }
        })
    }

    /// Run one statement through the full stack. Reads may be answered from
    /// cache; writes invalidate their declared tags after success.
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.limiter.allow(&request.scope).await?;

        let decision = self.isolator.route(&request.sql, request.priority);

        if decision.class == QueryClass::Read {
            if let Some(policy) = &request.cache {
                if let Some(value) = self.cache.get(&policy.key).await {
                    debug!(key = %policy.key, "read served from cache");
                    self.metrics.incr_counter("queries_cache_served", 1, &[]);
                    return Ok(QueryResponse {
                        rows: value.as_array().cloned().unwrap_or_default(),
                        rows_affected: 0,
                        served_from_cache: true,
                        role: None,
                    });
                }
            }
        }

        let role = decision.role.clone();
        let outcome = self
            .breakers
            .call_through(&role, || async {
                let mut conn = self.pools.acquire(&role).await?;
                let outcome = conn.execute(&request.sql).await?;
                // Only a clean execution parks the connection for reuse;
                // an errored one is closed by drop.
                conn.release();
                Ok(outcome)
            })
            .await?;

        self.metrics.incr_counter(
            "queries_executed",
            1,
            &[("role", decision.role.to_string())],
        );

        match decision.class {
            QueryClass::Read => {
                if let Some(policy) = &request.cache {
                    self.cache
                        .set(
                            &policy.key,
                            Value::Array(outcome.rows.clone()),
                            policy.ttl,
                            &policy.tags,
                        )
                        .await;
                }
            }
            QueryClass::Write => {
                if !request.invalidate_tags.is_empty() {
                    self.cache.invalidate_by_tags(&request.invalidate_tags).await;
                }
            }
        }

        Ok(QueryResponse {
            rows: outcome.rows,
            rows_affected: outcome.rows_affected,
            served_from_cache: false,
            role: Some(decision.role),
        })
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    pub fn health_snapshot(&self) -> Vec<HealthStatus> {
        self.registry.statuses()
    }

    pub fn replica_snapshot(&self) -> Vec<ReplicaInfo> {
        self.registry.replicas()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Stop the background probe and maintenance tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for DatabaseGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
