//! Bounded per-role connection pools with idle sweep and lifetime retirement.

use crate::backend::{DatabaseConnection, DatabaseConnector, QueryOutcome};
use crate::config::{DbAccessConfig, PoolSettings};
use crate::error::{DbAccessError, Result};
use crate::types::Role;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Point-in-time pool counters for dashboards and the metrics exporter.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub role: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub active: u32,
    pub idle: u32,
    pub total_created: u64,
    pub total_acquire_wait_ms: u64,
}

impl PoolStats {
    pub fn utilization_percentage(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            f64::from(self.active) / f64::from(self.max_connections) * 100.0
        }
    }
}

struct IdleConn {
    conn: Box<dyn DatabaseConnection>,
    id: Uuid,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolInner {
    idle: VecDeque<IdleConn>,
    active: u32,
    total_created: u64,
    total_acquire_wait: Duration,
}

/// A bounded pool of connections to one database instance.
pub struct ConnectionPool {
    role: Role,
    endpoint: String,
    settings: PoolSettings,
    connector: Arc<dyn DatabaseConnector>,
    slots: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        role: Role,
        endpoint: String,
        settings: PoolSettings,
        connector: Arc<dyn DatabaseConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            endpoint,
            slots: Arc::new(Semaphore::new(settings.max_connections as usize)),
            settings,
            connector,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Acquire a connection, blocking up to the configured timeout while the
    /// pool is at max with nothing idle.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout(),
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(DbAccessError::Database(format!(
                    "pool for {} is closed",
                    self.role
                )))
            }
            Err(_) => {
                return Err(DbAccessError::PoolExhausted {
                    role: self.role.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        self.inner.lock().total_acquire_wait += started.elapsed();

        // Slot is ours: reuse a live parked connection or dial a new one.
        // Parked connections are pinged first; dead ones are discarded.
        let reusable = loop {
            let parked = self.inner.lock().idle.pop_front();
            match parked {
                Some(mut idle) => {
                    if idle.conn.ping().await.is_ok() {
                        break Some(idle);
                    }
                    debug!(role = %self.role, connection_id = %idle.id, "parked connection failed ping, discarding");
                }
                None => break None,
            }
        };

        let (conn, id, created_at) = match reusable {
            Some(idle) => {
                self.inner.lock().active += 1;
                (idle.conn, idle.id, idle.created_at)
            }
            None => {
                let conn = self.connector.connect(&self.endpoint).await?;
                let mut inner = self.inner.lock();
                inner.active += 1;
                inner.total_created += 1;
                (conn, Uuid::new_v4(), Instant::now())
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            id,
            created_at,
            _permit: Some(permit),
        })
    }

    fn put_back(&self, pooled: &mut PooledConnection) {
        let Some(conn) = pooled.conn.take() else {
            return;
        };
        let retire = pooled.created_at.elapsed() >= self.settings.max_lifetime();
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        if retire {
            debug!(role = %self.role, connection_id = %pooled.id, "retiring connection past max lifetime");
        } else {
            inner.idle.push_back(IdleConn {
                conn,
                id: pooled.id,
                created_at: pooled.created_at,
                idle_since: Instant::now(),
            });
        }
    }

    /// Eagerly bring the pool up to its floor of live connections.
    pub async fn warm(&self) -> Result<()> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.active + inner.idle.len() as u32 >= self.settings.min_connections {
                    return Ok(());
                }
            }
            let conn = self.connector.connect(&self.endpoint).await?;
            let mut inner = self.inner.lock();
            inner.total_created += 1;
            inner.idle.push_back(IdleConn {
                conn,
                id: Uuid::new_v4(),
                created_at: Instant::now(),
                idle_since: Instant::now(),
            });
        }
    }

    /// Drop idle connections past the idle timeout or max lifetime. The
    /// floor is restored by the `warm` call that follows in maintenance.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout();
        let max_lifetime = self.settings.max_lifetime();
        let mut inner = self.inner.lock();
        let before = inner.idle.len();
        inner.idle.retain(|idle| {
            idle.idle_since.elapsed() < idle_timeout && idle.created_at.elapsed() < max_lifetime
        });
        let removed = before - inner.idle.len();
        if removed > 0 {
            debug!(role = %self.role, removed, "swept idle connections");
        }
        removed
    }

    /// Periodic sweep-and-rewarm task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.settings.sweep_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                pool.sweep_idle();
                if let Err(e) = pool.warm().await {
                    warn!(role = %pool.role, error = %e, "pool re-warm failed, will retry next sweep");
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            role: self.role.to_string(),
            min_connections: self.settings.min_connections,
            max_connections: self.settings.max_connections,
            active: inner.active,
            idle: inner.idle.len() as u32,
            total_created: inner.total_created,
            total_acquire_wait_ms: inner.total_acquire_wait.as_millis() as u64,
        }
    }
}

/// A connection checked out of its pool. Call [`PooledConnection::release`]
/// to return it; dropping it instead closes the connection but still frees
/// the slot and the active count, so a cancelled caller cannot leak capacity.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Box<dyn DatabaseConnection>>,
    id: Uuid,
    created_at: Instant,
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("live", &self.conn.is_some())
            .finish()
    }
}

impl PooledConnection {
    pub async fn execute(&mut self, sql: &str) -> Result<QueryOutcome> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            DbAccessError::Database("connection already returned to pool".into())
        })?;
        conn.execute(sql).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            DbAccessError::Database("connection already returned to pool".into())
        })?;
        conn.ping().await
    }

    pub fn role(&self) -> &Role {
        self.pool.role()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Return the connection to its originating pool.
    pub fn release(mut self) {
        let pool = Arc::clone(&self.pool);
        pool.put_back(&mut self);
        // Drop now only frees the permit; `conn` was taken by put_back.
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            let mut inner = self.pool.inner.lock();
            inner.active = inner.active.saturating_sub(1);
            debug!(role = %self.pool.role, connection_id = %self.id, "connection dropped without release, closing");
        }
    }
}

/// Owns one [`ConnectionPool`] per configured role.
pub struct PoolManager {
    pools: HashMap<Role, Arc<ConnectionPool>>,
}

impl PoolManager {
    pub fn new(config: &DbAccessConfig, connector: Arc<dyn DatabaseConnector>) -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            Role::Primary,
            ConnectionPool::new(
                Role::Primary,
                config.instances.primary.endpoint.clone(),
                config.pool.clone(),
                Arc::clone(&connector),
            ),
        );
        for replica in &config.instances.replicas {
            let role = Role::replica(&replica.id);
            pools.insert(
                role.clone(),
                ConnectionPool::new(
                    role,
                    replica.endpoint.clone(),
                    config.pool.clone(),
                    Arc::clone(&connector),
                ),
            );
        }
        Self { pools }
    }

    pub fn pool(&self, role: &Role) -> Option<&Arc<ConnectionPool>> {
        self.pools.get(role)
    }

    pub async fn acquire(&self, role: &Role) -> Result<PooledConnection> {
        let pool = self
            .pools
            .get(role)
            .ok_or_else(|| DbAccessError::Database(format!("no pool configured for {role}")))?;
        pool.acquire().await
    }

    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    pub async fn warm_all(&self) -> Result<()> {
        futures::future::try_join_all(self.pools.values().map(|pool| pool.warm())).await?;
        Ok(())
    }

    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        self.pools
            .values()
            .map(ConnectionPool::spawn_maintenance)
            .collect()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.role.cmp(&b.role));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::StubConnector;

    fn test_settings() -> PoolSettings {
        PoolSettings {
            min_connections: 2,
            max_connections: 4,
            acquire_timeout_ms: 50,
            idle_timeout_secs: 300,
            max_lifetime_secs: 3_600,
            sweep_interval_secs: 30,
        }
    }

    fn test_pool(settings: PoolSettings) -> (Arc<ConnectionPool>, Arc<StubConnector>) {
        let connector = Arc::new(StubConnector::new());
        let pool = ConnectionPool::new(
            Role::Primary,
            "db://primary".to_string(),
            settings,
            Arc::clone(&connector) as Arc<dyn DatabaseConnector>,
        );
        (pool, connector)
    }

    #[tokio::test]
    async fn acquire_release_reuses_connections() {
        let (pool, connector) = test_pool(test_settings());
        let conn = pool.acquire().await.unwrap();
        conn.release();
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(connector.connections_opened(), 1);

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total_created, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let mut settings = test_settings();
        settings.max_connections = 2;
        let (pool, _) = test_pool(settings);

        let held_a = pool.acquire().await.unwrap();
        let held_b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbAccessError::PoolExhausted { .. }));

        held_a.release();
        let reacquired = pool.acquire().await.unwrap();
        reacquired.release();
        held_b.release();
    }

    #[tokio::test]
    async fn active_plus_idle_never_exceeds_max() {
        let (pool, _) = test_pool(test_settings());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        let stats = pool.stats();
        assert_eq!(stats.active + stats.idle, 4);
        for conn in held {
            conn.release();
        }
        let stats = pool.stats();
        assert!(stats.active + stats.idle <= stats.max_connections);
        assert_eq!(stats.idle, 4);
    }

    #[tokio::test]
    async fn warm_reaches_floor_without_consuming_slots() {
        let (pool, connector) = test_pool(test_settings());
        pool.warm().await.unwrap();
        assert_eq!(connector.connections_opened(), 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);

        // Warmed connections are still acquirable up to max.
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.stats().active, 4);
        for conn in held {
            conn.release();
        }
    }

    #[tokio::test]
    async fn dead_parked_connection_discarded_on_reuse() {
        let (pool, connector) = test_pool(test_settings());
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(pool.stats().idle, 1);

        // The parked connection no longer answers pings; acquire must
        // discard it and dial fresh instead of handing it back.
        connector.fail_pings("db://primary");
        let mut conn = pool.acquire().await.unwrap();
        conn.execute("SELECT 1").await.unwrap();
        conn.release();
        assert_eq!(connector.connections_opened(), 2);

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn sweep_removes_idle_past_timeout() {
        let mut settings = test_settings();
        settings.idle_timeout_secs = 0; // everything idle is immediately stale
        let (pool, _) = test_pool(settings);
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(pool.stats().idle, 1);
        let removed = pool.sweep_idle();
        assert_eq!(removed, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn over_age_connection_retired_on_release() {
        let mut settings = test_settings();
        settings.max_lifetime_secs = 0;
        let (pool, connector) = test_pool(settings);
        let conn = pool.acquire().await.unwrap();
        conn.release();
        // Retired instead of parked, so the next acquire dials fresh.
        assert_eq!(pool.stats().idle, 0);
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(connector.connections_opened(), 2);
    }

    #[tokio::test]
    async fn dropped_connection_frees_slot_and_count() {
        let mut settings = test_settings();
        settings.max_connections = 1;
        let (pool, connector) = test_pool(settings);
        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(pool.stats().active, 1);
        } // dropped without release
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 0);

        // Slot is free again.
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(connector.connections_opened(), 2);
    }

    #[tokio::test]
    async fn concurrent_acquire_release_stays_within_bounds() {
        let (pool, _) = test_pool(test_settings());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let mut conn = pool.acquire().await.unwrap();
                    conn.execute("SELECT 1").await.unwrap();
                    conn.release();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.idle <= stats.max_connections);
    }

    #[tokio::test]
    async fn manager_routes_roles_to_their_pools() {
        let mut config = DbAccessConfig::default();
        config.pool = test_settings();
        config.instances.replicas.push(crate::config::InstanceConfig {
            id: "r1".into(),
            endpoint: "db://replica-1".into(),
        });
        let connector = Arc::new(StubConnector::new());
        let manager = PoolManager::new(&config, connector as Arc<dyn DatabaseConnector>);

        let mut primary = manager.acquire(&Role::Primary).await.unwrap();
        primary.execute("INSERT INTO t VALUES (1)").await.unwrap();
        manager.release(primary);

        let mut replica = manager.acquire(&Role::replica("r1")).await.unwrap();
        replica.execute("SELECT 1").await.unwrap();
        manager.release(replica);

        assert!(manager.acquire(&Role::replica("missing")).await.is_err());
        assert_eq!(manager.stats().len(), 2);
    }
}
