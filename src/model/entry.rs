//! Entry types: one post in a logbook.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Priority at which an entry is pinned before normal entries. Anything
/// above this counts as important and also surfaces in ancestor logbooks.
pub const PRIORITY_PINNED: i64 = 100;

/// One post in a logbook.
///
/// `follows` points at the parent entry of a reply chain; the transitive
/// closure of an entry and its followups is a thread. Attributes are a
/// dynamic dictionary whose shape is declared by the owning logbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub logbook_id: i64,
    pub title: Option<String>,
    pub authors: Vec<Author>,
    pub content: Option<String>,
    pub content_type: String,
    pub metadata: Map<String, serde_json::Value>,
    pub attributes: Map<String, serde_json::Value>,
    pub priority: i64,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
    pub follows_id: Option<i64>,
    pub archived: bool,
}

/// One author of an entry. Authors are plain attribution records, not
/// accounts; the service stores whatever the directory lookup returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Entry {
    /// The latest of creation and last change, used for sorting and
    /// previous/next navigation.
    pub fn timestamp(&self) -> Timestamp {
        self.last_changed_at.unwrap_or(self.created_at)
    }
}
