//! Core data model for elogd.
//!
//! These types represent the conceptual architecture: logbooks, entries,
//! changes, locks, and attachments. The storage layer owns all rows;
//! nothing here is ever deleted by normal operations, `archived` is the
//! tombstone.

mod attachment;
mod change;
mod entry;
mod lock;
mod logbook;

pub use attachment::Attachment;
pub use change::{Change, ChangeMeta};
pub use entry::{Author, Entry, PRIORITY_PINNED};
pub use lock::Lock;
pub use logbook::{AttributeSpec, AttributeType, Logbook};

/// The default content type for entries and logbook templates.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=UTF-8";
