//! Attachment storage: metadata rows for files in the blob tree.
//!
//! Rows may be inserted before their entry exists (inline images are
//! extracted while the entry is still being created) and bound afterwards.

use jiff::Timestamp;
use serde_json::{Map, Value};

use crate::model::Attachment;

use super::entry::load_entry;
use super::{encode_ts, json_column, ts_column, Result, Storage, StorageError};

/// Fields for a new attachment row. The blob itself has already been
/// written to the upload tree by the pipeline.
#[derive(Debug)]
pub struct NewAttachment {
    pub entry_id: Option<i64>,
    pub filename: Option<String>,
    pub timestamp: Timestamp,
    pub path: String,
    pub content_type: Option<String>,
    pub embedded: bool,
    pub metadata: Option<Map<String, Value>>,
}

impl Storage {
    /// Inserts an attachment row, binding it to its entry when known.
    pub fn insert_attachment(&self, new: NewAttachment) -> Result<Attachment> {
        let conn = self.conn();
        if let Some(entry_id) = new.entry_id {
            load_entry(&conn, entry_id)?;
        }
        conn.execute(
            "INSERT INTO attachment (entry_id, filename, timestamp, path,
                                     content_type, embedded, metadata, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            rusqlite::params![
                new.entry_id,
                new.filename,
                encode_ts(new.timestamp),
                new.path,
                new.content_type,
                new.embedded,
                new.metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        load_attachment(&conn, conn.last_insert_rowid())
    }

    /// Binds unowned attachments to an entry, after the entry exists.
    pub fn bind_attachments(&self, attachment_ids: &[i64], entry_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        load_entry(&tx, entry_id)?;
        for &id in attachment_ids {
            let updated = tx.execute(
                "UPDATE attachment SET entry_id = ?1 WHERE id = ?2",
                rusqlite::params![entry_id, id],
            )?;
            if updated == 0 {
                return Err(StorageError::AttachmentNotFound(id));
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads one attachment row.
    pub fn get_attachment(&self, id: i64) -> Result<Attachment> {
        load_attachment(&self.conn(), id)
    }

    /// The non-archived attachments of an entry, oldest first. Pass
    /// `embedded` to keep only inline images (or only real uploads).
    pub fn entry_attachments(
        &self,
        entry_id: i64,
        embedded: Option<bool>,
    ) -> Result<Vec<Attachment>> {
        let conn = self.conn();
        let mut sql = format!(
            "{ATTACHMENT_SELECT} WHERE entry_id = ?1 AND NOT archived"
        );
        if let Some(embedded) = embedded {
            sql.push_str(if embedded {
                " AND embedded"
            } else {
                " AND NOT embedded"
            });
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([entry_id], decode_attachment)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Archives an attachment. The blob stays on disk; the row is only
    /// tombstoned.
    pub fn archive_attachment(&self, id: i64) -> Result<Attachment> {
        let conn = self.conn();
        let updated = conn.execute("UPDATE attachment SET archived = 1 WHERE id = ?1", [id])?;
        if updated == 0 {
            return Err(StorageError::AttachmentNotFound(id));
        }
        load_attachment(&conn, id)
    }
}

const ATTACHMENT_SELECT: &str = "SELECT id, entry_id, filename, timestamp, path,
    content_type, embedded, metadata, archived FROM attachment";

fn load_attachment(conn: &rusqlite::Connection, id: i64) -> Result<Attachment> {
    conn.query_row(
        &format!("{ATTACHMENT_SELECT} WHERE id = ?1"),
        [id],
        decode_attachment,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::AttachmentNotFound(id),
        other => other.into(),
    })
}

fn decode_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let timestamp: String = row.get(3)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(Attachment {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        filename: row.get(2)?,
        timestamp: ts_column(3, &timestamp)?,
        path: row.get(4)?,
        content_type: row.get(5)?,
        embedded: row.get(6)?,
        metadata: metadata
            .as_deref()
            .map(|raw| json_column(7, raw))
            .transpose()?,
        archived: row.get(8)?,
    })
}
