//! Logbook types: named containers for entries, optionally nested.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// A logbook is a collection of entries, and (possibly) other logbooks.
///
/// The attribute specs declared here define the shape of the attribute
/// dictionaries carried by the logbook's entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logbook {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Default body prefilled by clients when composing a new entry.
    pub template: Option<String>,
    pub template_content_type: String,
    pub parent_id: Option<i64>,
    pub attributes: Vec<AttributeSpec>,
    pub metadata: Map<String, serde_json::Value>,
    pub archived: bool,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
}

/// Declaration of one entry attribute within a logbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    /// Legal values, meaningful for `option` and `multioption`.
    #[serde(default)]
    pub options: Vec<String>,
}

/// The type of an entry attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Text,
    Number,
    Boolean,
    Option,
    Multioption,
}

