//! Opaque identifier newtypes and minting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque node identifier. Nodes choose/register their own id string, so
/// unlike `TaskId` this wraps a plain string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque task identifier, minted by the control plane as a UUIDv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mints fresh `TaskId`s. Injectable so tests can get deterministic,
/// human-legible ids instead of random UUIDs.
pub trait IdMinter: Send + Sync {
    fn mint_task_id(&self) -> TaskId;
}

/// Default minter: random UUIDv4 per id, matching the teacher's use of
/// `Uuid::new_v4()` throughout `gator-db`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidMinter;

impl IdMinter for UuidMinter {
    fn mint_task_id(&self) -> TaskId {
        TaskId(Uuid::new_v4())
    }
}

/// Deterministic minter for tests: hands out ids built from an incrementing
/// counter so assertions can reference specific ids instead of "whatever
/// UUID came back".
#[derive(Debug, Default)]
pub struct SequentialMinter {
    next: AtomicU64,
}

impl SequentialMinter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdMinter for SequentialMinter {
    fn mint_task_id(&self) -> TaskId {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        TaskId(Uuid::from_u128(n as u128))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_minter_is_deterministic_and_unique() {
        let minter = SequentialMinter::new();
        let a = minter.mint_task_id();
        let b = minter.mint_task_id();
        assert_ne!(a, b);
        assert_eq!(a, TaskId(Uuid::from_u128(0)));
        assert_eq!(b, TaskId(Uuid::from_u128(1)));
    }

    #[test]
    fn node_id_display_roundtrips_string() {
        let id = NodeId::new("worker-7");
        assert_eq!(id.as_str(), "worker-7");
        assert_eq!(id.to_string(), "worker-7");
    }
}
