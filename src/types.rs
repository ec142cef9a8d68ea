//! Shared identifiers for database roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A database role a query can be routed to: the single writable primary or
/// one of the read replicas, addressed by its configured identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Replica(String),
}

impl Role {
    pub fn replica(id: impl Into<String>) -> Self {
        Role::Replica(id.into())
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica(id) => write!(f, "replica:{id}"),
        }
    }
}
