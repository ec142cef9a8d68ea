#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # DbAccess Core
//!
//! Database access resilience and caching middleware: everything that sits
//! between application code and a primary/replica PostgreSQL cluster to keep
//! it fast and alive under load.
//!
//! ## Architecture
//!
//! Each concern is an independent component; the [`gateway`] composes them
//! into a single `execute` control flow:
//!
//! - [`pool`] - Bounded per-role connection pools with sweep and re-warm
//! - [`health`] - Periodic instance probing and a shared health registry
//! - [`routing`] - Read/write isolation and weighted replica balancing
//! - [`resilience`] - Per-role circuit breakers over a rolling failure window
//! - [`cache`] - Two-tier (in-process LRU + distributed) cache with tag
//!   invalidation
//! - [`limiter`] - Sliding-window rate limiting over the distributed store
//! - [`backend`] - Strategy traits for the database, store, probes, alerts,
//!   and metrics, with in-memory doubles and a sqlx connector
//! - [`config`] - Validated, environment-aware YAML configuration
//! - [`error`] - Structured error handling
//!
//! ## Degradation posture
//!
//! Failures of auxiliary infrastructure never cascade to callers: a cache or
//! rate-limit store outage fails open, a lagging or unhealthy replica falls
//! back to the primary, and only three conditions surface as errors on the
//! request path: pool exhaustion, an open circuit, and an exceeded quota.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbaccess_core::backend::memory::{LogAlerts, MemoryStore, NoopMetrics, StaticProbe, StubConnector};
//! use dbaccess_core::config::DbAccessConfig;
//! use dbaccess_core::gateway::{DatabaseGateway, GatewayBackends, QueryRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = DatabaseGateway::new(
//!     DbAccessConfig::default(),
//!     GatewayBackends {
//!         connector: Arc::new(StubConnector::new()),
//!         store: Arc::new(MemoryStore::new()),
//!         probe: Arc::new(StaticProbe::new()),
//!         alerts: Arc::new(LogAlerts::new()),
//!         metrics: Arc::new(NoopMetrics),
//!     },
//! )
//! .await?;
//!
//! let response = gateway.execute(QueryRequest::new("SELECT 1")).await?;
//! println!("rows: {}", response.rows.len());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod limiter;
pub mod logging;
pub mod pool;
pub mod resilience;
pub mod routing;
pub mod types;

pub use config::DbAccessConfig;
pub use error::{DbAccessError, Result};
pub use gateway::{DatabaseGateway, GatewayBackends, QueryRequest, QueryResponse};
pub use types::Role;
