//! # Two-Tier Cache
//!
//! L1 is a strict in-process LRU (pure accelerator); L2 is the shared
//! distributed store and the system of record for invalidation. Keys carry
//! tag sets indexed in both tiers so a write can invalidate every dependent
//! entry in one call. Every L2 failure is handled fail-open: a cache outage
//! costs latency, never correctness or availability.

pub mod manager;

pub use manager::CacheManager;
