//! # Read Routing
//!
//! Two cooperating policies: the [`balancer`] picks a replica by smooth
//! weighted round-robin over health-derived weights, and the [`isolator`]
//! decides whether a query may go to a replica at all (writes and priority
//! reads pin to the primary; lagging replicas fall back to the primary).
//! The lag check lives in the isolator so the fallback policy stays testable
//! independent of balancing strategy.

pub mod balancer;
pub mod isolator;

pub use balancer::ReplicaBalancer;
pub use isolator::{classify, FallbackReason, Priority, QueryClass, RouteDecision, WorkloadIsolator};
