//! PostgreSQL backend over sqlx.
//!
//! Implements [`DatabaseConnector`]/[`DatabaseConnection`] with raw
//! `PgConnection`s (the pool layer above owns lifecycle, not `PgPool`) and an
//! [`InstanceProbe`] issuing standard recovery-status queries. Host-level
//! CPU/memory/disk are not observable over SQL; the probe reports zeros for
//! those and a deployment wires in a host collector when it has one.

use super::{
    DatabaseConnection, DatabaseConnector, InstanceProbe, ProbeReading, QueryOutcome,
};
use crate::error::{DbAccessError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row};
use std::time::Instant;

const LAG_SQL: &str = "SELECT COALESCE(EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp()), 0.0)::float8 AS lag_secs";

pub struct PostgresConnector;

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DatabaseConnection>> {
        let conn = PgConnection::connect(endpoint)
            .await
            .map_err(|e| DbAccessError::Database(e.to_string()))?;
        Ok(Box::new(PostgresSession { conn }))
    }
}

pub struct PostgresSession {
    conn: PgConnection,
}

#[async_trait]
impl DatabaseConnection for PostgresSession {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome> {
        let head = sql.trim_start().to_ascii_lowercase();
        if head.starts_with("select") || head.starts_with("with") || head.starts_with("show") {
            let rows = sqlx::query(sql)
                .fetch_all(&mut self.conn)
                .await
                .map_err(|e| DbAccessError::Database(e.to_string()))?;
            Ok(QueryOutcome {
                rows_affected: rows.len() as u64,
                rows: rows.iter().map(row_to_json).collect(),
            })
        } else {
            let done = sqlx::query(sql)
                .execute(&mut self.conn)
                .await
                .map_err(|e| DbAccessError::Database(e.to_string()))?;
            Ok(QueryOutcome {
                rows: Vec::new(),
                rows_affected: done.rows_affected(),
            })
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| DbAccessError::Database(e.to_string()))
    }
}

fn row_to_json(row: &PgRow) -> serde_json::Value {
    use serde_json::Value;
    use sqlx::TypeInfo;

    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "INT2" => row
                .try_get::<Option<i16>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::from(f64::from(v))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name).ok().flatten(),
            _ => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
        };
        object.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

/// SQL-level probe: connectivity plus replication lag plus response time.
pub struct PostgresProbe {
    connector: PostgresConnector,
}

impl Default for PostgresProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresProbe {
    pub fn new() -> Self {
        Self {
            connector: PostgresConnector,
        }
    }
}

#[async_trait]
impl InstanceProbe for PostgresProbe {
    async fn probe(&self, _instance_id: &str, endpoint: &str) -> Result<ProbeReading> {
        let started = Instant::now();
        let mut conn = match self.connector.connect(endpoint).await {
            Ok(conn) => conn,
            Err(_) => return Ok(ProbeReading::disconnected()),
        };

        let lag_secs = match conn.execute(LAG_SQL).await {
            Ok(outcome) => outcome
                .rows
                .first()
                .and_then(|row| row.get("lag_secs"))
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            Err(_) => return Ok(ProbeReading::disconnected()),
        };

        Ok(ProbeReading {
            connected: true,
            replication_lag_secs: lag_secs,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            response_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
        })
    }
}
