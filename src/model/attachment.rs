//! Attachment metadata: files associated with entries.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Metadata record for one stored file.
///
/// The file itself lives in the blob tree; only its relative path is
/// recorded here. `entry_id` may be null transiently while an upload is
/// in flight for an entry that doesn't exist yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub entry_id: Option<i64>,
    /// Sanitised basename of the uploaded file.
    pub filename: Option<String>,
    pub timestamp: Timestamp,
    /// Path within the upload folder. Opaque and stable.
    pub path: String,
    pub content_type: Option<String>,
    /// Whether this file was extracted from inline entry content.
    pub embedded: bool,
    /// May contain the original image `size` and the `thumbnail_size`.
    pub metadata: Option<Map<String, serde_json::Value>>,
    pub archived: bool,
}

impl Attachment {
    /// The URL path under which the blob is served.
    pub fn link(&self) -> String {
        format!("/attachments/{}", self.path)
    }

    /// The URL path of the thumbnail variant.
    pub fn thumbnail_link(&self) -> String {
        format!("/attachments/{}.thumbnail", self.path)
    }
}
