//! Logbook storage: create, update (with change records), hierarchy
//! queries, and historical revisions.

use jiff::Timestamp;
use serde_json::{Map, Value};

use crate::model::{AttributeSpec, Change, ChangeMeta, Logbook};
use crate::revision;

use super::{encode_ts, json_column, ts_column, Result, Storage, StorageError};

/// Fields for a new logbook.
#[derive(Debug, Default)]
pub struct NewLogbook {
    pub name: String,
    pub description: Option<String>,
    pub template: Option<String>,
    pub template_content_type: Option<String>,
    pub parent_id: Option<i64>,
    pub attributes: Vec<AttributeSpec>,
    pub metadata: Map<String, Value>,
    pub archived: bool,
}

/// A partial update of a logbook. `None` leaves the field untouched;
/// `parent_id` distinguishes "don't move" (`None`) from "move to top
/// level" (`Some(None)`).
#[derive(Debug, Default)]
pub struct LogbookPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub template: Option<Option<String>>,
    pub template_content_type: Option<String>,
    pub parent_id: Option<Option<i64>>,
    pub attributes: Option<Vec<AttributeSpec>>,
    pub metadata: Option<Map<String, Value>>,
    pub archived: Option<bool>,
}

impl Storage {
    /// Creates a new logbook.
    pub fn create_logbook(&self, new: NewLogbook) -> Result<Logbook> {
        check_unique_attribute_names(&new.attributes)?;
        let conn = self.conn();
        if let Some(parent_id) = new.parent_id {
            load_logbook(&conn, parent_id)?;
        }
        let created_at = Timestamp::now();
        conn.execute(
            "INSERT INTO logbook (name, description, template, template_content_type,
                                  parent_id, attributes, metadata, archived, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                new.name,
                new.description,
                new.template,
                new.template_content_type
                    .as_deref()
                    .unwrap_or(crate::model::DEFAULT_CONTENT_TYPE),
                new.parent_id,
                serde_json::to_string(&new.attributes)?,
                serde_json::to_string(&new.metadata)?,
                new.archived,
                encode_ts(created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        load_logbook(&conn, id)
    }

    /// Updates a logbook, storing the old values as a change record.
    ///
    /// Reparenting walks the proposed parent's ancestor chain to keep the
    /// hierarchy acyclic.
    pub fn update_logbook(
        &self,
        id: i64,
        patch: &LogbookPatch,
        meta: &ChangeMeta,
    ) -> Result<Logbook> {
        if let Some(attributes) = &patch.attributes {
            check_unique_attribute_names(attributes)?;
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let logbook = load_logbook(&tx, id)?;
        if let Some(Some(parent_id)) = patch.parent_id {
            check_not_cyclic(&tx, id, parent_id)?;
        }

        let old_state = logbook_state(&logbook);
        let mut updated = logbook.clone();
        apply_patch(&mut updated, patch);
        let new_state = logbook_state(&updated);

        let changed: Map<String, Value> = old_state
            .iter()
            .filter(|(field, old)| new_state.get(*field) != Some(old))
            .map(|(field, old)| (field.clone(), old.clone()))
            .collect();

        let now = Timestamp::now();
        tx.execute(
            "INSERT INTO logbookchange (logbook_id, changed, timestamp,
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
        tx.execute(
            "UPDATE logbook SET name = ?1, description = ?2, template = ?3,
                    template_content_type = ?4, parent_id = ?5, attributes = ?6,
                    metadata = ?7, archived = ?8, last_changed_at = ?9
             WHERE id = ?10",
            rusqlite::params![
                updated.name,
                updated.description,
                updated.template,
                updated.template_content_type,
                updated.parent_id,
                serde_json::to_string(&updated.attributes)?,
                serde_json::to_string(&updated.metadata)?,
                updated.archived,
                encode_ts(now),
                id,
            ],
        )?;

        let logbook = load_logbook(&tx, id)?;
        tx.commit()?;
        Ok(logbook)
    }

    /// Loads a single logbook.
    pub fn get_logbook(&self, id: i64) -> Result<Logbook> {
        load_logbook(&self.conn(), id)
    }

    /// Lists top-level logbooks, oldest first.
    pub fn list_top_level_logbooks(&self, include_archived: bool) -> Result<Vec<Logbook>> {
        self.list_logbooks_where("parent_id IS NULL", [], include_archived)
    }

    /// Lists the direct children of a logbook, oldest first.
    pub fn child_logbooks(&self, parent_id: i64, include_archived: bool) -> Result<Vec<Logbook>> {
        self.list_logbooks_where("parent_id = ?1", rusqlite::params![parent_id], include_archived)
    }

    fn list_logbooks_where(
        &self,
        predicate: &str,
        params: impl rusqlite::Params,
        include_archived: bool,
    ) -> Result<Vec<Logbook>> {
        let archived = if include_archived {
            ""
        } else {
            " AND NOT archived"
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{LOGBOOK_SELECT} WHERE {predicate}{archived} ORDER BY id"
        ))?;
        let rows = stmt.query_map(params, decode_logbook)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The chain of parents of a logbook, root first.
    pub fn logbook_ancestors(&self, id: i64) -> Result<Vec<Logbook>> {
        let conn = self.conn();
        let mut ancestors = Vec::new();
        let mut current = load_logbook(&conn, id)?;
        while let Some(parent_id) = current.parent_id {
            current = load_logbook(&conn, parent_id)?;
            ancestors.push(current.clone());
        }
        ancestors.reverse();
        Ok(ancestors)
    }

    /// All change records of a logbook, oldest first.
    pub fn logbook_changes(&self, id: i64) -> Result<Vec<Change>> {
        let conn = self.conn();
        load_logbook(&conn, id)?;
        load_changes(&conn, "logbookchange", "logbook_id", id)
    }

    /// A historical view of a logbook. `n` equal to the revision count
    /// returns the current state.
    pub fn logbook_revision(&self, id: i64, n: usize) -> Result<Map<String, Value>> {
        let conn = self.conn();
        let logbook = load_logbook(&conn, id)?;
        let changes = load_changes(&conn, "logbookchange", "logbook_id", id)?;
        if n > changes.len() {
            return Err(StorageError::RevisionNotFound {
                subject: id,
                revisions: changes.len(),
                wanted: n,
            });
        }

        let pre_images: Vec<_> = changes.into_iter().map(|c| c.changed).collect();
        let mut view = revision::reconstruct(&logbook_state(&logbook), &pre_images, n);
        view.insert("id".into(), logbook.id.into());
        view.insert("revision_n".into(), n.into());
        view.insert("created_at".into(), logbook.created_at.to_string().into());
        Ok(view)
    }
}

/// The diffable serialised state of a logbook. Timestamps are derived
/// bookkeeping and are not part of the change log.
pub(crate) fn logbook_state(logbook: &Logbook) -> Map<String, Value> {
    let mut state = Map::new();
    state.insert("name".into(), logbook.name.clone().into());
    state.insert("description".into(), opt_string(&logbook.description));
    state.insert("template".into(), opt_string(&logbook.template));
    state.insert(
        "template_content_type".into(),
        logbook.template_content_type.clone().into(),
    );
    state.insert(
        "parent_id".into(),
        logbook.parent_id.map_or(Value::Null, Value::from),
    );
    state.insert(
        "attributes".into(),
        serde_json::to_value(&logbook.attributes).unwrap_or(Value::Null),
    );
    state.insert("metadata".into(), Value::Object(logbook.metadata.clone()));
    state.insert("archived".into(), logbook.archived.into());
    state
}

pub(crate) fn opt_string(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::from)
}

fn apply_patch(logbook: &mut Logbook, patch: &LogbookPatch) {
    if let Some(name) = &patch.name {
        logbook.name = name.clone();
    }
    if let Some(description) = &patch.description {
        logbook.description = description.clone();
    }
    if let Some(template) = &patch.template {
        logbook.template = template.clone();
    }
    if let Some(content_type) = &patch.template_content_type {
        logbook.template_content_type = content_type.clone();
    }
    if let Some(parent_id) = patch.parent_id {
        logbook.parent_id = parent_id;
    }
    if let Some(attributes) = &patch.attributes {
        logbook.attributes = attributes.clone();
    }
    if let Some(metadata) = &patch.metadata {
        logbook.metadata = metadata.clone();
    }
    if let Some(archived) = patch.archived {
        logbook.archived = archived;
    }
}

fn check_unique_attribute_names(attributes: &[AttributeSpec]) -> Result<()> {
    for (i, spec) in attributes.iter().enumerate() {
        if attributes[..i].iter().any(|other| other.name == spec.name) {
            return Err(StorageError::DuplicateAttribute(spec.name.clone()));
        }
    }
    Ok(())
}

/// Walk the proposed parent's ancestor chain; if the logbook itself shows
/// up, the reparent would close a cycle.
fn check_not_cyclic(conn: &rusqlite::Connection, id: i64, parent_id: i64) -> Result<()> {
    let mut cursor = Some(parent_id);
    while let Some(current) = cursor {
        if current == id {
            return Err(StorageError::ParentCycle {
                logbook: id,
                parent: parent_id,
            });
        }
        cursor = load_logbook(conn, current)?.parent_id;
    }
    Ok(())
}

const LOGBOOK_SELECT: &str = "SELECT id, name, description, template, template_content_type,
    parent_id, attributes, metadata, archived, created_at, last_changed_at FROM logbook";

pub(crate) fn load_logbook(conn: &rusqlite::Connection, id: i64) -> Result<Logbook> {
    conn.query_row(
        &format!("{LOGBOOK_SELECT} WHERE id = ?1"),
        [id],
        decode_logbook,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::LogbookNotFound(id),
        other => other.into(),
    })
}

fn decode_logbook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Logbook> {
    let attributes: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let last_changed_at: Option<String> = row.get(10)?;
    Ok(Logbook {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        template: row.get(3)?,
        template_content_type: row.get(4)?,
        parent_id: row.get(5)?,
        attributes: json_column(6, &attributes)?,
        metadata: json_column(7, &metadata)?,
        archived: row.get(8)?,
        created_at: ts_column(9, &created_at)?,
        last_changed_at: last_changed_at
            .as_deref()
            .map(|raw| ts_column(10, raw))
            .transpose()?,
    })
}

/// Load the ordered change log of a subject from either change table.
pub(crate) fn load_changes(
    conn: &rusqlite::Connection,
    table: &str,
    subject_column: &str,
    subject_id: i64,
) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, {subject_column}, changed, timestamp, change_authors,
                change_comment, change_ip
         FROM {table} WHERE {subject_column} = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([subject_id], decode_change)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn decode_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<Change> {
    let changed: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    let authors: Option<String> = row.get(4)?;
    Ok(Change {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        changed: json_column(2, &changed)?,
        timestamp: ts_column(3, &timestamp)?,
        change_authors: authors
            .as_deref()
            .map(|raw| json_column(4, raw))
            .transpose()?,
        change_comment: row.get(5)?,
        change_ip: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::model::AttributeType;

    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn sample_logbook(storage: &Storage, name: &str, parent: Option<i64>) -> Logbook {
        storage
            .create_logbook(NewLogbook {
                name: name.into(),
                parent_id: parent,
                ..NewLogbook::default()
            })
            .unwrap()
    }

    #[test]
    fn create_and_load_logbook() {
        let storage = test_storage();
        let created = storage
            .create_logbook(NewLogbook {
                name: "Logbook1".into(),
                description: Some("Hello".into()),
                ..NewLogbook::default()
            })
            .unwrap();

        let loaded = storage.get_logbook(created.id).unwrap();
        assert_eq!(loaded.name, "Logbook1");
        assert_eq!(loaded.description.as_deref(), Some("Hello"));
        assert_eq!(loaded.template_content_type, "text/html; charset=UTF-8");
        assert!(loaded.last_changed_at.is_none());
    }

    #[test]
    fn load_nonexistent_logbook_fails() {
        let storage = test_storage();
        let err = storage.get_logbook(999).unwrap_err();
        assert!(matches!(err, StorageError::LogbookNotFound(999)));
    }

    #[test]
    fn create_with_missing_parent_fails() {
        let storage = test_storage();
        let err = storage
            .create_logbook(NewLogbook {
                name: "orphan".into(),
                parent_id: Some(42),
                ..NewLogbook::default()
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::LogbookNotFound(42)));
    }

    #[test]
    fn duplicate_attribute_names_rejected() {
        let storage = test_storage();
        let dup = AttributeSpec {
            name: "a".into(),
            kind: AttributeType::Text,
            required: false,
            options: vec![],
        };
        let err = storage
            .create_logbook(NewLogbook {
                name: "lb".into(),
                attributes: vec![dup.clone(), dup],
                ..NewLogbook::default()
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateAttribute(_)));
    }

    #[test]
    fn update_records_change_with_old_values() {
        let storage = test_storage();
        let lb = sample_logbook(&storage, "Logbook1", None);

        let updated = storage
            .update_logbook(
                lb.id,
                &LogbookPatch {
                    name: Some("Logbook2".into()),
                    ..LogbookPatch::default()
                },
                &ChangeMeta::default(),
            )
            .unwrap();
        assert_eq!(updated.name, "Logbook2");
        assert!(updated.last_changed_at.is_some());

        let changes = storage.logbook_changes(lb.id).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed["name"], json!("Logbook1"));
    }

    #[test]
    fn revisions_replay_old_states() {
        let storage = test_storage();
        let lb = storage
            .create_logbook(NewLogbook {
                name: "Name1".into(),
                description: Some("Original description".into()),
                ..NewLogbook::default()
            })
            .unwrap();

        storage
            .update_logbook(
                lb.id,
                &LogbookPatch {
                    name: Some("Name2".into()),
                    description: Some(Some("New description".into())),
                    ..LogbookPatch::default()
                },
                &ChangeMeta::default(),
            )
            .unwrap();
        storage
            .update_logbook(
                lb.id,
                &LogbookPatch {
                    name: Some("Name1".into()),
                    ..LogbookPatch::default()
                },
                &ChangeMeta::default(),
            )
            .unwrap();

        let v0 = storage.logbook_revision(lb.id, 0).unwrap();
        assert_eq!(v0["name"], json!("Name1"));
        assert_eq!(v0["description"], json!("Original description"));
        assert_eq!(v0["revision_n"], json!(0));

        let v1 = storage.logbook_revision(lb.id, 1).unwrap();
        assert_eq!(v1["name"], json!("Name2"));
        assert_eq!(v1["description"], json!("New description"));

        let v2 = storage.logbook_revision(lb.id, 2).unwrap();
        assert_eq!(v2["name"], json!("Name1"));
        assert_eq!(v2["description"], json!("New description"));
    }

    #[test]
    fn revision_out_of_range_fails() {
        let storage = test_storage();
        let lb = sample_logbook(&storage, "lb", None);
        let err = storage.logbook_revision(lb.id, 1).unwrap_err();
        assert!(matches!(err, StorageError::RevisionNotFound { .. }));
    }

    #[test]
    fn reparent_to_own_descendant_fails() {
        let storage = test_storage();
        let parent = sample_logbook(&storage, "parent", None);
        let child = sample_logbook(&storage, "child", Some(parent.id));
        let grandchild = sample_logbook(&storage, "grandchild", Some(child.id));

        let err = storage
            .update_logbook(
                parent.id,
                &LogbookPatch {
                    parent_id: Some(Some(grandchild.id)),
                    ..LogbookPatch::default()
                },
                &ChangeMeta::default(),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::ParentCycle { .. }));

        // Reparenting to an unrelated logbook is fine.
        let other = sample_logbook(&storage, "other", None);
        let moved = storage
            .update_logbook(
                child.id,
                &LogbookPatch {
                    parent_id: Some(Some(other.id)),
                    ..LogbookPatch::default()
                },
                &ChangeMeta::default(),
            )
            .unwrap();
        assert_eq!(moved.parent_id, Some(other.id));
    }

    #[test]
    fn ancestors_run_root_first() {
        let storage = test_storage();
        let root = sample_logbook(&storage, "root", None);
        let mid = sample_logbook(&storage, "mid", Some(root.id));
        let leaf = sample_logbook(&storage, "leaf", Some(mid.id));

        let ancestors = storage.logbook_ancestors(leaf.id).unwrap();
        let ids: Vec<i64> = ancestors.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![root.id, mid.id]);
    }

    #[test]
    fn listings_exclude_archived() {
        let storage = test_storage();
        let visible = sample_logbook(&storage, "visible", None);
        let hidden = storage
            .create_logbook(NewLogbook {
                name: "hidden".into(),
                archived: true,
                ..NewLogbook::default()
            })
            .unwrap();

        let top = storage.list_top_level_logbooks(false).unwrap();
        let ids: Vec<i64> = top.iter().map(|l| l.id).collect();
        assert!(ids.contains(&visible.id));
        assert!(!ids.contains(&hidden.id));

        let all = storage.list_top_level_logbooks(true).unwrap();
        assert_eq!(all.len(), 2);
    }
}
