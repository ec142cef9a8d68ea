//! # Backend Interfaces
//!
//! Strategy seams for everything this crate consumes but does not implement:
//! the database cluster, the distributed store shared by the cache L2 tier
//! and the rate limiter, instance probes, the alerting sink, and the metrics
//! sink. Any backend satisfying these traits works; [`memory`] provides the
//! in-process implementations used by tests and defaults, [`postgres`] the
//! sqlx-backed production connector.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::Result;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::time::Duration;

/// Result of a single statement execution. Reads come back as JSON objects
/// keyed by column name; writes report affected rows.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub rows: Vec<serde_json::Value>,
    pub rows_affected: u64,
}

/// A single live connection to one database instance.
#[async_trait]
pub trait DatabaseConnection: Send {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome>;

    /// Cheap liveness check used before reusing a parked connection.
    async fn ping(&mut self) -> Result<()>;
}

/// Factory for connections against a given endpoint. One connector serves
/// every pool; the endpoint distinguishes the instances.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DatabaseConnection>>;
}

/// Outcome of the store-side atomic sliding-window operation.
#[derive(Debug, Clone)]
pub struct WindowDecision {
    pub allowed: bool,
    pub current_count: u32,
    /// When a denied scope regains capacity (oldest recorded event ages out).
    pub retry_after: Option<Duration>,
}

/// Distributed key-value store shared across processes, used by the cache L2
/// tier and the rate limiter.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn add_to_set(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Count events for `key` within the trailing `window`; if below `limit`,
    /// record the current event. Check and append are atomic end-to-end on
    /// the store side so concurrent callers cannot both slip past the limit.
    async fn count_and_record(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<WindowDecision>;
}

/// One observation of a database instance's vital signs.
#[derive(Debug, Clone)]
pub struct ProbeReading {
    pub connected: bool,
    pub replication_lag_secs: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub response_time_ms: f64,
}

impl ProbeReading {
    /// Reading synthesized when a probe errors or times out.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            replication_lag_secs: 0.0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            response_time_ms: 0.0,
        }
    }

    pub fn healthy() -> Self {
        Self {
            connected: true,
            replication_lag_secs: 0.0,
            cpu_percent: 10.0,
            memory_percent: 30.0,
            disk_percent: 20.0,
            response_time_ms: 2.0,
        }
    }
}

/// Collector of instance metrics consumed by the health monitor.
#[async_trait]
pub trait InstanceProbe: Send + Sync {
    async fn probe(&self, instance_id: &str, endpoint: &str) -> Result<ProbeReading>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// External alerting sink, notified on primary failover and breaker trips.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, severity: AlertSeverity, message: &str);
}

/// Metrics sink for counters and gauges: pool utilization, cache hit/miss,
/// rate-limit violations, breaker transitions.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]);
    fn record_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]);
}

/// OpenTelemetry-backed metrics sink over the globally installed meter
/// provider. With no provider installed the instruments are no-ops, which is
/// exactly the behavior wanted in tests.
pub struct OtelMetrics {
    meter: opentelemetry::metrics::Meter,
}

impl OtelMetrics {
    pub fn new(scope: &'static str) -> Self {
        Self {
            meter: opentelemetry::global::meter(scope),
        }
    }
}

impl MetricsSink for OtelMetrics {
    fn incr_counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]) {
        let attrs: Vec<KeyValue> = labels
            .iter()
            .map(|(k, v)| KeyValue::new(*k, v.clone()))
            .collect();
        self.meter.u64_counter(name).build().add(value, &attrs);
    }

    fn record_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        let attrs: Vec<KeyValue> = labels
            .iter()
            .map(|(k, v)| KeyValue::new(*k, v.clone()))
            .collect();
        self.meter.f64_gauge(name).build().record(value, &attrs);
    }
}
