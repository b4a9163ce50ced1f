//! Edit locks: advisory, time-limited, IP-owned markers.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// A temporary edit lock on one entry, to prevent overwriting changes.
///
/// Locks are persistent rows, not in-process mutexes: they survive
/// restarts and are visible across replicas. The point of locking is to
/// make it harder for users to overwrite each other's changes *by
/// mistake*, not to make it impossible. Ownership only ever transfers
/// through an explicit steal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: i64,
    pub entry_id: i64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub owned_by_ip: String,
    pub cancelled_at: Option<Timestamp>,
    pub cancelled_by_ip: Option<String>,
}

impl Lock {
    /// Whether the lock is in force at the given instant.
    pub fn active_at(&self, now: Timestamp) -> bool {
        self.cancelled_at.is_none() && self.expires_at > now
    }
}
