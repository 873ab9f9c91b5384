//! Time-ordered task identifiers.
//!
//! Task ids double as the database clustering key and, combined with
//! `CreatedAtUtc`, the recovery-paging cursor. UUIDv7 embeds a millisecond
//! timestamp in its high bits, so ids sort the same way their creation time
//! does without a separate sequence.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-ordered task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new, time-ordered id.
    pub fn new() -> Self {
        TaskId(Uuid::now_v7())
    }

    /// Wrap an existing id, e.g. one read back from storage.
    pub fn from_uuid(id: Uuid) -> Self {
        TaskId(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Deterministic shard index for the scheduler, derived by unsigned
    /// modulo over an FNV-1a hash of the id's bytes so the assignment never
    /// depends on a signed-hash sign bit.
    pub fn shard_index(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count > 0, "shard_count must be at least 1");
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in self.0.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        (hash % shard_count as u64) as usize
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        TaskId(id)
    }
}

impl From<TaskId> for Uuid {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskId(Uuid::parse_str(s)?))
    }
}
