//! Request and response shapes of the JSON API, plus the marshalling
//! from storage types. Handlers stay thin: they parse, call the core,
//! and hand the result to these builders.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attributes;
use crate::content;
use crate::model::{Attachment, AttributeSpec, Author, Change, Entry, Lock, Logbook};
use crate::revision;
use crate::storage::{SearchHit, Storage, StorageError};

/// Listings show at most this much stripped content per entry.
const PREVIEW_CHARS: usize = 200;

// ── Responses ──

#[derive(Debug, Serialize)]
pub struct LogbookRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct LogbookChildDto {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub n_children: usize,
}

#[derive(Debug, Serialize)]
pub struct LogbookDto {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub template: Option<String>,
    pub template_content_type: String,
    pub parent: Option<LogbookRef>,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
    pub attributes: Vec<AttributeSpec>,
    pub metadata: Map<String, Value>,
    pub archived: bool,
    pub children: Vec<LogbookChildDto>,
    pub revision_n: usize,
}

#[derive(Debug, Serialize)]
pub struct AttachmentDto {
    pub id: i64,
    pub filename: Option<String>,
    pub timestamp: Timestamp,
    pub content_type: Option<String>,
    pub embedded: bool,
    pub metadata: Option<Map<String, Value>>,
    pub link: String,
    pub thumbnail_link: String,
}

#[derive(Debug, Serialize)]
pub struct LockDto {
    pub id: i64,
    pub entry_id: i64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub owned_by_ip: String,
    pub cancelled_at: Option<Timestamp>,
    pub cancelled_by_ip: Option<String>,
}

/// Followups ride inside their root entry and skip logbook context;
/// they are always in the same logbook as their parent.
#[derive(Debug, Serialize)]
pub struct FollowupDto {
    pub id: i64,
    pub title: Option<String>,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
    pub authors: Vec<Author>,
    pub content: Option<String>,
    pub content_type: String,
    pub attributes: Map<String, Value>,
    pub attachments: Vec<AttachmentDto>,
    pub n_followups: usize,
}

#[derive(Debug, Serialize)]
pub struct EntryDto {
    pub id: i64,
    pub logbook: LogbookRef,
    pub title: Option<String>,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
    pub authors: Vec<Author>,
    pub attributes: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub content: Option<String>,
    pub content_type: String,
    pub priority: i64,
    pub follows_id: Option<i64>,
    pub archived: bool,
    pub attachments: Vec<AttachmentDto>,
    pub followups: Vec<FollowupDto>,
    pub n_followups: usize,
    pub revision_n: usize,
    pub lock: Option<LockDto>,
    pub next: Option<i64>,
    pub previous: Option<i64>,
}

/// A row of a search result listing.
#[derive(Debug, Serialize)]
pub struct SearchHitDto {
    pub id: i64,
    pub logbook: LogbookRef,
    pub title: Option<String>,
    pub content_preview: Option<String>,
    pub created_at: Timestamp,
    pub last_changed_at: Option<Timestamp>,
    pub timestamp: Timestamp,
    pub priority: i64,
    pub authors: Vec<String>,
    pub followup_authors: Vec<String>,
    pub n_followups: u32,
    pub n_attachments: usize,
    pub attachment_preview: Option<AttachmentDto>,
}

#[derive(Debug, Serialize)]
pub struct ChangeDto {
    pub id: i64,
    pub revision_n: usize,
    pub timestamp: Timestamp,
    /// Field name → `{old, new}` pair.
    pub changed: Map<String, Value>,
    pub change_authors: Option<Vec<Author>>,
    pub change_comment: Option<String>,
    pub change_ip: Option<String>,
}

// ── Builders ──

pub fn logbook_ref(logbook: &Logbook) -> LogbookRef {
    LogbookRef {
        id: logbook.id,
        name: logbook.name.clone(),
    }
}

pub fn logbook_dto(storage: &Storage, logbook: &Logbook) -> Result<LogbookDto, StorageError> {
    let parent = logbook
        .parent_id
        .map(|id| storage.get_logbook(id))
        .transpose()?
        .map(|p| logbook_ref(&p));
    let children = storage
        .child_logbooks(logbook.id, false)?
        .into_iter()
        .map(|child| {
            Ok(LogbookChildDto {
                n_children: storage.child_logbooks(child.id, false)?.len(),
                id: child.id,
                name: child.name,
                description: child.description,
            })
        })
        .collect::<Result<_, StorageError>>()?;
    Ok(LogbookDto {
        id: logbook.id,
        name: logbook.name.clone(),
        description: logbook.description.clone(),
        template: logbook.template.clone(),
        template_content_type: logbook.template_content_type.clone(),
        parent,
        created_at: logbook.created_at,
        last_changed_at: logbook.last_changed_at,
        attributes: logbook.attributes.clone(),
        metadata: logbook.metadata.clone(),
        archived: logbook.archived,
        children,
        revision_n: storage.logbook_changes(logbook.id)?.len(),
    })
}

pub fn attachment_dto(attachment: &Attachment) -> AttachmentDto {
    AttachmentDto {
        id: attachment.id,
        filename: attachment.filename.clone(),
        timestamp: attachment.timestamp,
        content_type: attachment.content_type.clone(),
        embedded: attachment.embedded,
        metadata: attachment.metadata.clone(),
        link: attachment.link(),
        thumbnail_link: attachment.thumbnail_link(),
    }
}

pub fn lock_dto(lock: &Lock) -> LockDto {
    LockDto {
        id: lock.id,
        entry_id: lock.entry_id,
        created_at: lock.created_at,
        expires_at: lock.expires_at,
        owned_by_ip: lock.owned_by_ip.clone(),
        cancelled_at: lock.cancelled_at,
        cancelled_by_ip: lock.cancelled_by_ip.clone(),
    }
}

fn followup_dto(
    storage: &Storage,
    specs: &[AttributeSpec],
    entry: &Entry,
) -> Result<FollowupDto, StorageError> {
    let attachments = storage
        .entry_attachments(entry.id, None)?
        .iter()
        .map(attachment_dto)
        .collect();
    Ok(FollowupDto {
        id: entry.id,
        title: entry.title.clone(),
        created_at: entry.created_at,
        last_changed_at: entry.last_changed_at,
        authors: entry.authors.clone(),
        content: entry.content.clone(),
        content_type: entry.content_type.clone(),
        attributes: attributes::convert_for_display(specs, &entry.attributes),
        attachments,
        n_followups: storage.entry_followups(entry.id)?.len(),
    })
}

pub fn entry_dto(storage: &Storage, entry: &Entry) -> Result<EntryDto, StorageError> {
    let logbook = storage.get_logbook(entry.logbook_id)?;
    let followups = storage
        .entry_followups(entry.id)?
        .iter()
        .map(|f| followup_dto(storage, &logbook.attributes, f))
        .collect::<Result<Vec<_>, _>>()?;
    let attachments: Vec<AttachmentDto> = storage
        .entry_attachments(entry.id, None)?
        .iter()
        .map(attachment_dto)
        .collect();
    let lock = storage
        .get_lock(entry.id, None, false, false, None)?
        .map(|l| lock_dto(&l));
    let (previous, next) = storage.entry_neighbours(entry)?;
    Ok(EntryDto {
        id: entry.id,
        logbook: logbook_ref(&logbook),
        title: entry.title.clone(),
        created_at: entry.created_at,
        last_changed_at: entry.last_changed_at,
        authors: entry.authors.clone(),
        attributes: attributes::convert_for_display(&logbook.attributes, &entry.attributes),
        metadata: entry.metadata.clone(),
        content: entry.content.clone(),
        content_type: entry.content_type.clone(),
        priority: entry.priority,
        follows_id: entry.follows_id,
        archived: entry.archived,
        attachments,
        n_followups: followups.len(),
        followups,
        revision_n: storage.entry_revision_count(entry.id)?,
        lock,
        next,
        previous,
    })
}

pub fn search_hit_dto(storage: &Storage, hit: &SearchHit) -> Result<SearchHitDto, StorageError> {
    let logbook = storage.get_logbook(hit.entry.logbook_id)?;
    let attachments = storage.entry_attachments(hit.entry.id, None)?;
    let content_preview = hit.entry.content.as_deref().map(|html| {
        let text = content::strip_tags(html);
        let mut preview: String = text.trim().chars().take(PREVIEW_CHARS).collect();
        preview = preview.replace('\n', " ");
        preview
    });
    Ok(SearchHitDto {
        id: hit.entry.id,
        logbook: logbook_ref(&logbook),
        title: hit.entry.title.clone(),
        content_preview,
        created_at: hit.entry.created_at,
        last_changed_at: hit.entry.last_changed_at,
        timestamp: hit.timestamp,
        priority: hit.entry.priority,
        authors: hit.entry.authors.iter().map(|a| a.name.clone()).collect(),
        followup_authors: hit.followup_authors.iter().map(|a| a.name.clone()).collect(),
        n_followups: hit.n_followups,
        n_attachments: attachments.len(),
        attachment_preview: attachments.first().map(attachment_dto),
    })
}

/// Change records paired with their `{old, new}` diffs, oldest first.
pub fn change_dtos(current_state: &Map<String, Value>, changes: &[Change]) -> Vec<ChangeDto> {
    let pre_images: Vec<_> = changes.iter().map(|c| c.changed.clone()).collect();
    changes
        .iter()
        .enumerate()
        .map(|(n, change)| ChangeDto {
            id: change.id,
            revision_n: n,
            timestamp: change.timestamp,
            changed: revision::diff_at(current_state, &pre_images, n),
            change_authors: change.change_authors.clone(),
            change_comment: change.change_comment.clone(),
            change_ip: change.change_ip.clone(),
        })
        .collect()
}

// ── Requests ──

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateLogbookRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_content_type: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub archived: bool,
}

/// Absent fields stay untouched; explicit `null` clears nullable ones.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateLogbookRequest {
    pub name: Option<String>,
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub template: Option<Option<String>>,
    pub template_content_type: Option<String>,
    #[serde(default, with = "double_option")]
    pub parent_id: Option<Option<i64>>,
    pub attributes: Option<Vec<AttributeSpec>>,
    pub metadata: Option<Map<String, Value>>,
    pub archived: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntryRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_changed_at: Option<String>,
    #[serde(default)]
    pub follows_id: Option<i64>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateEntryRequest {
    /// The revision this edit was based on. Mandatory; its absence is a
    /// malformed request, a mismatch a conflict.
    pub revision_n: Option<usize>,
    #[serde(default, with = "double_option")]
    pub title: Option<Option<String>>,
    pub authors: Option<Vec<Author>>,
    #[serde(default, with = "double_option")]
    pub content: Option<Option<String>>,
    pub content_type: Option<String>,
    pub attributes: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
    pub priority: Option<i64>,
    #[serde(default, with = "double_option")]
    pub follows_id: Option<Option<i64>>,
    pub archived: Option<bool>,
    pub created_at: Option<String>,
    pub last_changed_at: Option<String>,
    pub change_comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AcquireLockRequest {
    #[serde(default)]
    pub steal: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelLockRequest {
    #[serde(default)]
    pub lock_id: Option<i64>,
}

/// serde treats a missing field and an explicit `null` identically for
/// `Option<Option<T>>` unless the inner layer is deserialised by hand.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
