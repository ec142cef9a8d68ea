//! # Resilience
//!
//! Per-role circuit breakers over a rolling failure-rate window. The breaker
//! reflects actual call outcomes and is deliberately orthogonal to the
//! health monitor: it is authoritative for call admission, while health
//! state only shapes load-balancing weight. A breaker can be open against a
//! nominally healthy instance (network partition) and closed against a
//! degraded one.

pub mod circuit_breaker;
pub mod manager;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use manager::CircuitBreakerManager;
