//! # Connection Pool Manager
//!
//! One bounded pool per database role. Slots are bounded by a semaphore so
//! `acquire` blocks (with a timeout) exactly when the pool is at max with
//! nothing idle; bookkeeping lives behind a short `parking_lot` mutex and is
//! never held across I/O. A periodic maintenance task sweeps idle and
//! over-age connections and eagerly re-warms the pool floor.

pub mod manager;

pub use manager::{ConnectionPool, PoolManager, PoolStats, PooledConnection};
