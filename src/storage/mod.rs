//! SQLite persistence for logbooks, entries, changes, locks, and
//! attachments.
//!
//! One database file holds everything. JSON-typed columns carry the
//! dynamic shapes (`authors`, `attributes`, `metadata`, `options`,
//! `changed`); timestamps are stored as naive UTC text in a fixed-width
//! format so that lexicographic comparison in SQL is also chronological
//! comparison. The search engine leans on the JSON1 functions and
//! recursive CTEs, so [`Storage::open`] probes for them and refuses to
//! start without them.

mod attachment;
mod entry;
mod lock;
mod logbook;
mod search;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jiff::civil;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::model::Lock;

pub use attachment::NewAttachment;
pub use entry::{EntryPatch, NewEntry};
pub use logbook::{LogbookPatch, NewLogbook};
pub use search::{SearchHit, SearchQuery};

pub(crate) use entry::entry_state;
pub(crate) use logbook::logbook_state;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("logbook not found: {0}")]
    LogbookNotFound(i64),

    #[error("entry not found: {0}")]
    EntryNotFound(i64),

    #[error("lock not found for entry {0}")]
    LockNotFound(i64),

    #[error("attachment not found: {0}")]
    AttachmentNotFound(i64),

    #[error("revision {wanted} not found: subject {subject} has {revisions} revisions")]
    RevisionNotFound {
        subject: i64,
        revisions: usize,
        wanted: usize,
    },

    #[error("entry {} is locked by {}", lock.entry_id, lock.owned_by_ip)]
    EntryLocked { lock: Box<Lock> },

    #[error("stale revision for entry {entry}: entry is at revision {actual}, edit was based on {supplied}")]
    StaleRevision {
        entry: i64,
        actual: usize,
        supplied: usize,
    },

    #[error("missing revision number for edit of entry {0}")]
    MissingRevision(i64),

    #[error("moving logbook {logbook} under {parent} would create a cycle")]
    ParentCycle { logbook: i64, parent: i64 },

    #[error("duplicate attribute name in logbook: {0}")]
    DuplicateAttribute(String),

    #[error("entry {follows} is in logbook {expected}, not {actual}: followups must stay in their logbook")]
    CrossLogbookFollowup {
        follows: i64,
        expected: i64,
        actual: i64,
    },

    #[error(transparent)]
    Attributes(#[from] crate::attributes::AttributeError),

    #[error("this SQLite build lacks a required feature: {0}")]
    UnsupportedSqlite(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("time error: {0}")]
    Time(#[from] jiff::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// Idempotent schema. `archived` is a tombstone everywhere; rows are never
/// deleted by normal operations.
const SCHEMA_DDL: &str = "
CREATE TABLE IF NOT EXISTS logbook (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    template TEXT,
    template_content_type TEXT NOT NULL,
    parent_id INTEGER REFERENCES logbook(id),
    attributes TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    archived INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_changed_at TEXT
);

CREATE TABLE IF NOT EXISTS logbookchange (
    id INTEGER PRIMARY KEY,
    logbook_id INTEGER NOT NULL REFERENCES logbook(id),
    changed TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    change_authors TEXT,
    change_comment TEXT,
    change_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_logbookchange_logbook ON logbookchange(logbook_id);

CREATE TABLE IF NOT EXISTS entry (
    id INTEGER PRIMARY KEY,
    logbook_id INTEGER NOT NULL REFERENCES logbook(id),
    title TEXT,
    authors TEXT NOT NULL DEFAULT '[]',
    content TEXT,
    content_type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    attributes TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_changed_at TEXT,
    follows_id INTEGER REFERENCES entry(id),
    archived INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_entry_logbook ON entry(logbook_id);
CREATE INDEX IF NOT EXISTS idx_entry_follows ON entry(follows_id);

CREATE TABLE IF NOT EXISTS entrychange (
    id INTEGER PRIMARY KEY,
    entry_id INTEGER NOT NULL REFERENCES entry(id),
    changed TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    change_authors TEXT,
    change_comment TEXT,
    change_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_entrychange_entry ON entrychange(entry_id);

CREATE TABLE IF NOT EXISTS entrylock (
    id INTEGER PRIMARY KEY,
    entry_id INTEGER NOT NULL REFERENCES entry(id),
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    owned_by_ip TEXT NOT NULL,
    cancelled_at TEXT,
    cancelled_by_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_entrylock_entry ON entrylock(entry_id);

CREATE TABLE IF NOT EXISTS attachment (
    id INTEGER PRIMARY KEY,
    entry_id INTEGER REFERENCES entry(id),
    filename TEXT,
    timestamp TEXT NOT NULL,
    path TEXT NOT NULL,
    content_type TEXT,
    embedded INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    archived INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_attachment_entry ON attachment(entry_id);
";

/// SQLite-backed storage. All access goes through one connection guarded
/// by a mutex; every write runs inside a single transaction.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Opens (or creates) the database file and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    /// An in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        probe_sql_features(&conn)?;
        register_regexp(&conn)?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Locks the connection. A poisoned mutex just means another thread
    /// panicked mid-operation; its transaction has already rolled back, so
    /// the connection itself is still usable.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The search engine needs JSON field extraction, JSON array iteration,
/// and recursive CTEs. Refuse to start on a SQLite build without them.
fn probe_sql_features(conn: &Connection) -> Result<()> {
    let probes: [(&str, &str); 3] = [
        ("json_extract", "SELECT json_extract('{\"a\":1}', '$.a')"),
        ("json_each", "SELECT count(*) FROM json_each('[1,2]')"),
        (
            "recursive CTE",
            "WITH RECURSIVE t(n) AS (VALUES(1) UNION ALL SELECT n+1 FROM t WHERE n < 3) \
             SELECT max(n) FROM t",
        ),
    ];
    for (feature, sql) in probes {
        conn.query_row(sql, [], |_| Ok(()))
            .map_err(|_| StorageError::UnsupportedSqlite(feature.to_string()))?;
    }
    Ok(())
}

/// Register a `regexp(pattern, text)` scalar function so search filters
/// can use the `REGEXP` operator. Compiled patterns are cached per
/// connection; a query repeats the same handful of patterns many times.
fn register_regexp(conn: &Connection) -> Result<()> {
    let cache: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: String = ctx.get(0)?;
            let text = match ctx.get_raw(1) {
                rusqlite::types::ValueRef::Null => return Ok(false),
                value => value
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?,
            };
            let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(re) = cache.get(&pattern) {
                return Ok(re.is_match(text));
            }
            let re = Regex::new(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let matched = re.is_match(text);
            cache.insert(pattern, re);
            Ok(matched)
        },
    )?;
    Ok(())
}

/// Fixed-width naive UTC format stored in timestamp columns.
const TS_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TS_READ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Encode an instant as naive UTC column text.
pub(crate) fn encode_ts(ts: Timestamp) -> String {
    ts.strftime(TS_WRITE_FORMAT).to_string()
}

/// Decode naive UTC column text back to an instant.
pub(crate) fn decode_ts(raw: &str) -> core::result::Result<Timestamp, jiff::Error> {
    let dt: civil::DateTime = jiff::fmt::strtime::parse(TS_READ_FORMAT, raw)?.to_datetime()?;
    Ok(dt.to_zoned(TimeZone::UTC)?.timestamp())
}

/// Decode a timestamp column, mapping parse failures the way rusqlite row
/// decoders expect.
pub(crate) fn ts_column(idx: usize, raw: &str) -> rusqlite::Result<Timestamp> {
    decode_ts(raw).map_err(|e| conversion_error(idx, e))
}

/// Decode a JSON column, mapping parse failures the way rusqlite row
/// decoders expect.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.conn();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('logbook', 'logbookchange', 'entry', 'entrychange', 'entrylock', 'attachment')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("elogd.db");
        drop(Storage::open(&path).unwrap());
        // Re-opening against the existing file must not fail.
        drop(Storage::open(&path).unwrap());
    }

    #[test]
    fn timestamps_round_trip_as_naive_utc() {
        let ts: Timestamp = "2019-01-14T12:30:45.123456Z".parse().unwrap();
        let encoded = encode_ts(ts);
        assert_eq!(encoded, "2019-01-14 12:30:45.123456");
        assert_eq!(decode_ts(&encoded).unwrap(), ts);
    }

    #[test]
    fn zone_aware_input_is_normalised_to_utc() {
        // +02:00 input lands two hours earlier on the wire.
        let ts: Timestamp = "2019-01-14T12:00:00+02:00".parse().unwrap();
        assert_eq!(encode_ts(ts), "2019-01-14 10:00:00.000000");
    }

    #[test]
    fn encoded_timestamps_sort_lexicographically() {
        let a: Timestamp = "2019-01-14T12:00:00Z".parse().unwrap();
        let b: Timestamp = "2019-02-06T08:00:00Z".parse().unwrap();
        assert!(encode_ts(a) < encode_ts(b));
    }

    #[test]
    fn regexp_function_is_available() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.conn();
        let matched: bool = conn
            .query_row("SELECT 'Not so bad content' REGEXP 'Not.*content'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(matched);
        let matched: bool = conn
            .query_row("SELECT 'hello' REGEXP '^world'", [], |r| r.get(0))
            .unwrap();
        assert!(!matched);
    }
}
