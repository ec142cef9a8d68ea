//! In-process backend implementations.
//!
//! `MemoryStore` gives the full distributed-store contract (including the
//! atomic window operation) inside one process, which is what unit and
//! integration tests run against. `StubConnector`, `StaticProbe`,
//! `LogAlerts`, `NoopMetrics`, and `RecordingMetrics` are the matching
//! doubles for the other seams. `MemoryStore` and `StaticProbe` also support simulated outages so
//! fail-open paths are testable.

use super::{
    AlertSeverity, AlertSink, DatabaseConnection, DatabaseConnector, DistributedStore,
    InstanceProbe, MetricsSink, ProbeReading, QueryOutcome, WindowDecision,
};
use crate::error::{DbAccessError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Distributed-store semantics in process. All operations take one short
/// lock; the window operation is atomic by construction.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: every operation fails with
    /// `StoreUnavailable` until restored.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DbAccessError::StoreUnavailable(
                "simulated store outage".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.ensure_available()?;
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_available()?;
        let mut removed = 0;
        {
            let mut entries = self.entries.lock();
            for key in keys {
                if entries.remove(key).is_some() {
                    removed += 1;
                }
            }
        }
        let mut sets = self.sets.lock();
        for key in keys {
            if sets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<()> {
        self.ensure_available()?;
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_and_record(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<WindowDecision> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let events = windows.entry(key.to_string()).or_default();

        while let Some(oldest) = events.front() {
            if now.duration_since(*oldest) >= window {
                events.pop_front();
            } else {
                break;
            }
        }

        if (events.len() as u32) < limit {
            events.push_back(now);
            Ok(WindowDecision {
                allowed: true,
                current_count: events.len() as u32,
                retry_after: None,
            })
        } else {
            let retry_after = events
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)));
            Ok(WindowDecision {
                allowed: false,
                current_count: events.len() as u32,
                retry_after,
            })
        }
    }
}

struct StubState {
    failing_endpoints: Mutex<HashSet<String>>,
    ping_failing_endpoints: Mutex<HashSet<String>>,
    connections_opened: AtomicU64,
    executed: Mutex<Vec<(String, String)>>,
}

/// Connector double: hands out connections that log what they execute and
/// can be told to fail per endpoint.
pub struct StubConnector {
    state: Arc<StubState>,
}

impl Default for StubConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl StubConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StubState {
                failing_endpoints: Mutex::new(HashSet::new()),
                ping_failing_endpoints: Mutex::new(HashSet::new()),
                connections_opened: AtomicU64::new(0),
                executed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_endpoint(&self, endpoint: &str) {
        self.state
            .failing_endpoints
            .lock()
            .insert(endpoint.to_string());
    }

    pub fn restore_endpoint(&self, endpoint: &str) {
        self.state.failing_endpoints.lock().remove(endpoint);
    }

    /// Make only pings fail for `endpoint`; connect and execute still work.
    pub fn fail_pings(&self, endpoint: &str) {
        self.state
            .ping_failing_endpoints
            .lock()
            .insert(endpoint.to_string());
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// `(endpoint, sql)` pairs in execution order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.executed.lock().clone()
    }
}

#[async_trait]
impl DatabaseConnector for StubConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DatabaseConnection>> {
        if self.state.failing_endpoints.lock().contains(endpoint) {
            return Err(DbAccessError::Database(format!(
                "stub connect refused for {endpoint}"
            )));
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            endpoint: endpoint.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct StubConnection {
    endpoint: String,
    state: Arc<StubState>,
}

#[async_trait]
impl DatabaseConnection for StubConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome> {
        if self.state.failing_endpoints.lock().contains(&self.endpoint) {
            return Err(DbAccessError::Database(format!(
                "stub execute failed on {}",
                self.endpoint
            )));
        }
        self.state
            .executed
            .lock()
            .push((self.endpoint.clone(), sql.to_string()));
        Ok(QueryOutcome {
            rows: Vec::new(),
            rows_affected: 1,
        })
    }

    async fn ping(&mut self) -> Result<()> {
        let failing = self.state.failing_endpoints.lock().contains(&self.endpoint)
            || self
                .state
                .ping_failing_endpoints
                .lock()
                .contains(&self.endpoint);
        if failing {
            return Err(DbAccessError::Database(format!(
                "stub ping failed on {}",
                self.endpoint
            )));
        }
        Ok(())
    }
}

/// Probe double fed with canned readings per instance; unknown instances
/// report a healthy baseline.
#[derive(Default)]
pub struct StaticProbe {
    readings: Mutex<HashMap<String, ProbeReading>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reading(&self, instance_id: &str, reading: ProbeReading) {
        self.readings
            .lock()
            .insert(instance_id.to_string(), reading);
    }

    pub fn set_down(&self, instance_id: &str) {
        self.set_reading(instance_id, ProbeReading::disconnected());
    }
}

#[async_trait]
impl InstanceProbe for StaticProbe {
    async fn probe(&self, instance_id: &str, _endpoint: &str) -> Result<ProbeReading> {
        Ok(self
            .readings
            .lock()
            .get(instance_id)
            .cloned()
            .unwrap_or_else(ProbeReading::healthy))
    }
}

/// Alert sink that records everything it is told and logs it.
#[derive(Default)]
pub struct LogAlerts {
    messages: Mutex<Vec<(AlertSeverity, String)>>,
}

impl LogAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(AlertSeverity, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl AlertSink for LogAlerts {
    async fn notify(&self, severity: AlertSeverity, message: &str) {
        match severity {
            AlertSeverity::Critical => tracing::error!(alert = message, "alert raised"),
            AlertSeverity::Warning => tracing::warn!(alert = message, "alert raised"),
            AlertSeverity::Info => tracing::info!(alert = message, "alert raised"),
        }
        self.messages.lock().push((severity, message.to_string()));
    }
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _: &'static str, _: u64, _: &[(&'static str, String)]) {}
    fn record_gauge(&self, _: &'static str, _: f64, _: &[(&'static str, String)]) {}
}

/// Metrics sink that records every emission for assertions.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<Vec<(&'static str, u64, Vec<(&'static str, String)>)>>,
    gauges: Mutex<Vec<(&'static str, f64, Vec<(&'static str, String)>)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(n, _, _)| *n == name)
            .map(|(_, value, _)| value)
            .sum()
    }

    pub fn counter_labels(&self, name: &str) -> Vec<Vec<(&'static str, String)>> {
        self.counters
            .lock()
            .iter()
            .filter(|(n, _, _)| *n == name)
            .map(|(_, _, labels)| labels.clone())
            .collect()
    }

    pub fn gauge_values(&self, name: &str) -> Vec<f64> {
        self.gauges
            .lock()
            .iter()
            .filter(|(n, _, _)| *n == name)
            .map(|(_, value, _)| *value)
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr_counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]) {
        self.counters.lock().push((name, value, labels.to_vec()));
    }

    fn record_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        self.gauges.lock().push((name, value, labels.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_get_set_with_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn window_denies_past_limit_and_recovers() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(80);
        for _ in 0..3 {
            let decision = store.count_and_record("scope", window, 3).await.unwrap();
            assert!(decision.allowed);
        }
        let denied = store.count_and_record("scope", window, 3).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let again = store.count_and_record("scope", window, 3).await.unwrap();
        assert!(again.allowed);
    }

    #[tokio::test]
    async fn outage_simulation_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(DbAccessError::StoreUnavailable(_))
        ));
        assert!(store
            .count_and_record("scope", Duration::from_secs(1), 1)
            .await
            .is_err());
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn stub_connector_tracks_and_fails() {
        let connector = StubConnector::new();
        let mut conn = connector.connect("db://a").await.unwrap();
        conn.execute("SELECT 1").await.unwrap();
        assert_eq!(connector.connections_opened(), 1);
        assert_eq!(connector.executed()[0].1, "SELECT 1");

        connector.fail_endpoint("db://a");
        assert!(conn.execute("SELECT 1").await.is_err());
        assert!(connector.connect("db://a").await.is_err());
    }
}
