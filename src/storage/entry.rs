//! Entry storage: create, update (with optimistic concurrency, lock
//! checks, and change records), threads, and historical revisions.

use jiff::Timestamp;
use serde_json::{Map, Value};

use crate::attributes;
use crate::model::{Author, Change, ChangeMeta, Entry};
use crate::revision;

use super::lock::{active_lock, cancel_lock_row};
use super::logbook::{load_changes, load_logbook, opt_string};
use super::{encode_ts, json_column, ts_column, Result, Storage, StorageError};

/// Fields for a new entry.
#[derive(Debug)]
pub struct NewEntry {
    pub logbook_id: i64,
    pub title: Option<String>,
    pub authors: Vec<Author>,
    pub content: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Map<String, Value>,
    /// Raw attribute dictionary; validated against the logbook's specs.
    pub attributes: Map<String, Value>,
    pub priority: i64,
    pub created_at: Option<Timestamp>,
    pub last_changed_at: Option<Timestamp>,
    pub follows_id: Option<i64>,
    pub archived: bool,
}

impl NewEntry {
    /// An empty entry for the given logbook.
    pub fn in_logbook(logbook_id: i64) -> Self {
        Self {
            logbook_id,
            title: None,
            authors: Vec::new(),
            content: None,
            content_type: None,
            metadata: Map::new(),
            attributes: Map::new(),
            priority: 0,
            created_at: None,
            last_changed_at: None,
            follows_id: None,
            archived: false,
        }
    }
}

/// A partial update of an entry. `None` leaves the field untouched.
#[derive(Debug, Default)]
pub struct EntryPatch {
    pub title: Option<Option<String>>,
    pub authors: Option<Vec<Author>>,
    pub content: Option<Option<String>>,
    pub content_type: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub attributes: Option<Map<String, Value>>,
    pub priority: Option<i64>,
    pub follows_id: Option<Option<i64>>,
    pub archived: Option<bool>,
    /// Explicit creation time, for imports and syncs.
    pub created_at: Option<Timestamp>,
    /// Explicit change time, for imports and syncs. When absent the
    /// change timestamp is used (unless the edit touched only priority).
    pub last_changed_at: Option<Timestamp>,
}

impl Storage {
    /// Creates a new entry, validating its attributes against the owning
    /// logbook and its `follows` pointer against the thread rules.
    pub fn create_entry(&self, new: NewEntry) -> Result<Entry> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let logbook = load_logbook(&tx, new.logbook_id)?;
        let attributes = attributes::check_attributes(&logbook.attributes, &new.attributes)?;

        let mut priority = new.priority;
        if let Some(follows_id) = new.follows_id {
            let followed = load_entry(&tx, follows_id)?;
            if followed.logbook_id != new.logbook_id {
                return Err(StorageError::CrossLogbookFollowup {
                    follows: follows_id,
                    expected: followed.logbook_id,
                    actual: new.logbook_id,
                });
            }
            // Followups are never pinned; they sort inside their thread.
            priority = 0;
        }

        let created_at = new.created_at.unwrap_or_else(Timestamp::now);
        tx.execute(
            "INSERT INTO entry (logbook_id, title, authors, content, content_type,
                                metadata, attributes, priority, created_at,
                                last_changed_at, follows_id, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                new.logbook_id,
                new.title,
                serde_json::to_string(&new.authors)?,
                new.content,
                new.content_type
                    .as_deref()
                    .unwrap_or(crate::model::DEFAULT_CONTENT_TYPE),
                serde_json::to_string(&new.metadata)?,
                serde_json::to_string(&attributes)?,
                priority,
                encode_ts(created_at),
                new.last_changed_at.map(encode_ts),
                new.follows_id,
                new.archived,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let entry = load_entry(&tx, id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Updates an entry, storing the old values as a change record.
    ///
    /// The caller must supply the revision number its edit was based on;
    /// a mismatch means someone edited the entry in between. An active
    /// lock owned by a different IP blocks the edit; the caller's own
    /// lock is cancelled on success.
    pub fn update_entry(
        &self,
        id: i64,
        patch: &EntryPatch,
        expected_revision: Option<usize>,
        meta: &ChangeMeta,
    ) -> Result<Entry> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let entry = load_entry(&tx, id)?;

        let Some(supplied) = expected_revision else {
            return Err(StorageError::MissingRevision(id));
        };
        let actual = revision_count(&tx, id)?;
        if supplied != actual {
            return Err(StorageError::StaleRevision {
                entry: id,
                actual,
                supplied,
            });
        }

        let now = Timestamp::now();
        if let Some(lock) = active_lock(&tx, id, now)? {
            if meta.ip.as_deref() == Some(lock.owned_by_ip.as_str()) {
                cancel_lock_row(&tx, lock.id, meta.ip.as_deref(), now)?;
            } else {
                return Err(StorageError::EntryLocked {
                    lock: Box::new(lock),
                });
            }
        }

        let logbook = load_logbook(&tx, entry.logbook_id)?;
        let mut updated = entry.clone();
        apply_patch(&mut updated, patch);
        if let Some(attributes) = &patch.attributes {
            updated.attributes = attributes::check_attributes(&logbook.attributes, attributes)?;
        }
        if let Some(follows_id) = updated.follows_id {
            let followed = load_entry(&tx, follows_id)?;
            if followed.logbook_id != updated.logbook_id {
                return Err(StorageError::CrossLogbookFollowup {
                    follows: follows_id,
                    expected: followed.logbook_id,
                    actual: updated.logbook_id,
                });
            }
            updated.priority = 0;
        }

        let old_state = entry_state(&entry);
        let new_state = entry_state(&updated);
        let changed: Map<String, Value> = old_state
            .iter()
            .filter(|(field, old)| new_state.get(*field) != Some(old))
            .map(|(field, old)| (field.clone(), old.clone()))
            .collect();

        tx.execute(
            "INSERT INTO entrychange (entry_id, changed, timestamp,
                                      change_authors, change_comment, change_ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                serde_json::to_string(&changed)?,
                encode_ts(now),
                meta.authors
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                meta.comment,
                meta.ip,
            ],
        )?;

        // Priority only reorders listings; an edit that touched nothing
        // else keeps the entry's change time.
        let priority_only =
            changed.len() == 1 && changed.contains_key("priority") && patch.last_changed_at.is_none();
        let last_changed_at = if let Some(explicit) = patch.last_changed_at {
            Some(explicit)
        } else if priority_only {
            entry.last_changed_at
        } else {
            Some(now)
        };

        tx.execute(
            "UPDATE entry SET title = ?1, authors = ?2, content = ?3, content_type = ?4,
                    metadata = ?5, attributes = ?6, priority = ?7, created_at = ?8,
                    last_changed_at = ?9, follows_id = ?10, archived = ?11
             WHERE id = ?12",
            rusqlite::params![
                updated.title,
                serde_json::to_string(&updated.authors)?,
                updated.content,
                updated.content_type,
                serde_json::to_string(&updated.metadata)?,
                serde_json::to_string(&updated.attributes)?,
                updated.priority,
                encode_ts(updated.created_at),
                last_changed_at.map(encode_ts),
                updated.follows_id,
                updated.archived,
                id,
            ],
        )?;

        let entry = load_entry(&tx, id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Loads a single entry.
    pub fn get_entry(&self, id: i64) -> Result<Entry> {
        load_entry(&self.conn(), id)
    }

    /// The number of recorded changes, which is also the entry's current
    /// revision number.
    pub fn entry_revision_count(&self, id: i64) -> Result<usize> {
        let conn = self.conn();
        load_entry(&conn, id)?;
        revision_count(&conn, id)
    }

    /// All change records of an entry, oldest first.
    pub fn entry_changes(&self, id: i64) -> Result<Vec<Change>> {
        let conn = self.conn();
        load_entry(&conn, id)?;
        load_changes(&conn, "entrychange", "entry_id", id)
    }

    /// A historical view of an entry. `n` equal to the revision count
    /// returns the current state.
    pub fn entry_revision(&self, id: i64, n: usize) -> Result<Map<String, Value>> {
        let conn = self.conn();
        let entry = load_entry(&conn, id)?;
        let changes = load_changes(&conn, "entrychange", "entry_id", id)?;
        if n > changes.len() {
            return Err(StorageError::RevisionNotFound {
                subject: id,
                revisions: changes.len(),
                wanted: n,
            });
        }

        let pre_images: Vec<_> = changes.into_iter().map(|c| c.changed).collect();
        let mut view = revision::reconstruct(&entry_state(&entry), &pre_images, n);
        view.insert("id".into(), entry.id.into());
        view.insert("revision_n".into(), n.into());
        view.insert(
            "last_changed_at".into(),
            entry
                .last_changed_at
                .map_or(Value::Null, |ts| ts.to_string().into()),
        );
        Ok(view)
    }

    /// The root of the thread an entry belongs to (the entry itself when
    /// it follows nothing).
    pub fn thread_root(&self, id: i64) -> Result<Entry> {
        let conn = self.conn();
        let mut entry = load_entry(&conn, id)?;
        let mut hops = 0;
        while let Some(follows_id) = entry.follows_id {
            entry = load_entry(&conn, follows_id)?;
            hops += 1;
            if hops > 1000 {
                // A follows cycle can only come from direct DB tampering;
                // stop rather than spin.
                break;
            }
        }
        Ok(entry)
    }

    /// The direct followups of an entry, oldest first.
    pub fn entry_followups(&self, id: i64) -> Result<Vec<Entry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{ENTRY_SELECT} WHERE follows_id = ?1 AND NOT archived ORDER BY id"
        ))?;
        let rows = stmt.query_map([id], decode_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Previous and next thread roots in the same logbook, by the
    /// canonical order `(coalesce(last_changed_at, created_at), id)`.
    pub fn entry_neighbours(&self, entry: &Entry) -> Result<(Option<i64>, Option<i64>)> {
        let conn = self.conn();
        let ts = encode_ts(entry.timestamp());
        let previous = conn
            .query_row(
                "SELECT id FROM entry
                 WHERE logbook_id = ?1 AND follows_id IS NULL AND NOT archived
                   AND (coalesce(last_changed_at, created_at) < ?2
                        OR (coalesce(last_changed_at, created_at) = ?2 AND id < ?3))
                 ORDER BY coalesce(last_changed_at, created_at) DESC, id DESC
                 LIMIT 1",
                rusqlite::params![entry.logbook_id, ts, entry.id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(no_rows_as_none)?;
        let next = conn
            .query_row(
                "SELECT id FROM entry
                 WHERE logbook_id = ?1 AND follows_id IS NULL AND NOT archived
                   AND (coalesce(last_changed_at, created_at) > ?2
                        OR (coalesce(last_changed_at, created_at) = ?2 AND id > ?3))
                 ORDER BY coalesce(last_changed_at, created_at), id
                 LIMIT 1",
                rusqlite::params![entry.logbook_id, ts, entry.id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(no_rows_as_none)?;
        Ok((previous, next))
    }
}

fn no_rows_as_none<T>(err: rusqlite::Error) -> Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    }
}

fn apply_patch(entry: &mut Entry, patch: &EntryPatch) {
    if let Some(title) = &patch.title {
        entry.title = title.clone();
    }
    if let Some(authors) = &patch.authors {
        entry.authors = authors.clone();
    }
    if let Some(content) = &patch.content {
        entry.content = content.clone();
    }
    if let Some(content_type) = &patch.content_type {
        entry.content_type = content_type.clone();
    }
    if let Some(metadata) = &patch.metadata {
        entry.metadata = metadata.clone();
    }
    if let Some(priority) = patch.priority {
        entry.priority = priority;
    }
    if let Some(follows_id) = patch.follows_id {
        entry.follows_id = follows_id;
    }
    if let Some(archived) = patch.archived {
        entry.archived = archived;
    }
    if let Some(created_at) = patch.created_at {
        entry.created_at = created_at;
    }
    // attributes are applied after validation, in the caller.
}

/// The diffable serialised state of an entry. `last_changed_at` is derived
/// bookkeeping and is not part of the change log.
pub(crate) fn entry_state(entry: &Entry) -> Map<String, Value> {
    let mut state = Map::new();
    state.insert("logbook_id".into(), entry.logbook_id.into());
    state.insert("title".into(), opt_string(&entry.title));
    state.insert(
        "authors".into(),
        serde_json::to_value(&entry.authors).unwrap_or(Value::Null),
    );
    state.insert("content".into(), opt_string(&entry.content));
    state.insert("content_type".into(), entry.content_type.clone().into());
    state.insert("metadata".into(), Value::Object(entry.metadata.clone()));
    state.insert("attributes".into(), Value::Object(entry.attributes.clone()));
    state.insert("priority".into(), entry.priority.into());
    state.insert(
        "follows_id".into(),
        entry.follows_id.map_or(Value::Null, Value::from),
    );
    state.insert("archived".into(), entry.archived.into());
    state.insert("created_at".into(), entry.created_at.to_string().into());
    state
}

pub(crate) fn revision_count(conn: &rusqlite::Connection, entry_id: i64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM entrychange WHERE entry_id = ?1",
        [entry_id],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}

const ENTRY_SELECT: &str = "SELECT id, logbook_id, title, authors, content, content_type,
    metadata, attributes, priority, created_at, last_changed_at, follows_id, archived FROM entry";

pub(crate) fn load_entry(conn: &rusqlite::Connection, id: i64) -> Result<Entry> {
    conn.query_row(&format!("{ENTRY_SELECT} WHERE id = ?1"), [id], decode_entry)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::EntryNotFound(id),
            other => other.into(),
        })
}

pub(crate) fn decode_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let authors: String = row.get(3)?;
    let metadata: String = row.get(6)?;
    let attributes: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let last_changed_at: Option<String> = row.get(10)?;
    Ok(Entry {
        id: row.get(0)?,
        logbook_id: row.get(1)?,
        title: row.get(2)?,
        authors: json_column(3, &authors)?,
        content: row.get(4)?,
        content_type: row.get(5)?,
        metadata: json_column(6, &metadata)?,
        attributes: json_column(7, &attributes)?,
        priority: row.get(8)?,
        created_at: ts_column(9, &created_at)?,
        last_changed_at: last_changed_at
            .as_deref()
            .map(|raw| ts_column(10, raw))
            .transpose()?,
        follows_id: row.get(11)?,
        archived: row.get(12)?,
    })
}
