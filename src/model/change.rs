//! Change records: the revision history of logbooks and entries.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use super::Author;

/// One atomic mutation of a logbook or an entry.
///
/// Counter-intuitively, `changed` stores the *old* values: the pre-image
/// of exactly those fields that differed. The canonical state is always the
/// current row; historical revisions are reconstructed by replaying
/// pre-images backwards from the newest change (see [`crate::revision`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: i64,
    /// The logbook or entry this change belongs to.
    pub subject_id: i64,
    /// Field name → value *before* this change.
    pub changed: Map<String, serde_json::Value>,
    pub timestamp: Timestamp,
    pub change_authors: Option<Vec<Author>>,
    pub change_comment: Option<String>,
    pub change_ip: Option<String>,
}

/// Attribution attached to a mutation: who changed it, why, and from where.
#[derive(Debug, Clone, Default)]
pub struct ChangeMeta {
    pub authors: Option<Vec<Author>>,
    pub comment: Option<String>,
    pub ip: Option<String>,
}
