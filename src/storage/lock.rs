//! Lock storage: acquire, steal, cancel, and passive expiry of advisory
//! per-entry edit locks.
//!
//! An entry can not have more than one active lock at any given time.
//! The logic works like this: user A acquires a lock before editing;
//! user B trying to acquire the same lock is refused and can either wait
//! for it to expire (an hour by default), or explicitly steal it, in
//! which case A is in for a surprise at submit time. Submitting an edit
//! cancels the submitter's own lock. Expiry is passive: the row stays
//! around and is simply ignored once `expires_at` has passed.

use jiff::{Span, Timestamp};

use crate::model::Lock;

use super::entry::load_entry;
use super::{encode_ts, ts_column, Result, Storage, StorageError};

/// Default lock lifetime.
const DEFAULT_TTL_HOURS: i64 = 1;

impl Storage {
    /// Looks up the active lock on an entry, optionally acquiring it.
    ///
    /// - no active lock, `acquire`: a fresh lock owned by `ip` is created.
    /// - lock owned by `ip`, `acquire`: the existing lock is returned
    ///   (idempotent re-acquire).
    /// - lock owned by someone else, `acquire`, `steal`: the old lock is
    ///   cancelled on behalf of `ip` and a fresh one created. Ownership
    ///   never transfers any other way.
    /// - lock owned by someone else, `acquire`, not `steal`: fails with
    ///   [`StorageError::EntryLocked`] carrying the offending lock.
    ///
    /// Without `acquire` this is a plain read returning the active lock,
    /// if any.
    pub fn get_lock(
        &self,
        entry_id: i64,
        ip: Option<&str>,
        acquire: bool,
        steal: bool,
        ttl: Option<Span>,
    ) -> Result<Option<Lock>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        load_entry(&tx, entry_id)?;

        let now = Timestamp::now();
        let lock = match active_lock(&tx, entry_id, now)? {
            Some(existing) => {
                if acquire && steal {
                    cancel_lock_row(&tx, existing.id, ip, now)?;
                    Some(create_lock(&tx, entry_id, ip, now, ttl)?)
                } else if acquire && ip != Some(existing.owned_by_ip.as_str()) {
                    return Err(StorageError::EntryLocked {
                        lock: Box::new(existing),
                    });
                } else {
                    Some(existing)
                }
            }
            None => {
                if acquire {
                    Some(create_lock(&tx, entry_id, ip, now, ttl)?)
                } else {
                    None
                }
            }
        };
        tx.commit()?;
        Ok(lock)
    }

    /// Cancels a lock on behalf of `ip`. Idempotent on already-cancelled
    /// locks.
    pub fn cancel_lock(&self, lock_id: i64, ip: Option<&str>) -> Result<Lock> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let lock = load_lock(&tx, lock_id)?;
        if lock.cancelled_at.is_none() {
            cancel_lock_row(&tx, lock_id, ip, Timestamp::now())?;
        }
        let lock = load_lock(&tx, lock_id)?;
        tx.commit()?;
        Ok(lock)
    }

    /// Loads a lock row regardless of its state.
    pub fn get_lock_by_id(&self, lock_id: i64) -> Result<Lock> {
        load_lock(&self.conn(), lock_id)
    }
}

/// The single active lock of an entry, if any. Expired rows are simply
/// ignored, never deleted.
pub(crate) fn active_lock(
    conn: &rusqlite::Connection,
    entry_id: i64,
    now: Timestamp,
) -> Result<Option<Lock>> {
    let mut stmt = conn.prepare(&format!(
        "{LOCK_SELECT} WHERE entry_id = ?1 AND cancelled_at IS NULL
         ORDER BY id DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query_map([entry_id], decode_lock)?;
    let newest = rows.next().transpose()?;
    Ok(newest.filter(|lock| lock.active_at(now)))
}

pub(crate) fn cancel_lock_row(
    conn: &rusqlite::Connection,
    lock_id: i64,
    ip: Option<&str>,
    now: Timestamp,
) -> Result<()> {
    conn.execute(
        "UPDATE entrylock SET cancelled_at = ?1, cancelled_by_ip = ?2 WHERE id = ?3",
        rusqlite::params![encode_ts(now), ip, lock_id],
    )?;
    Ok(())
}

fn create_lock(
    conn: &rusqlite::Connection,
    entry_id: i64,
    ip: Option<&str>,
    now: Timestamp,
    ttl: Option<Span>,
) -> Result<Lock> {
    let ttl = ttl.unwrap_or_else(|| Span::new().hours(DEFAULT_TTL_HOURS));
    let expires_at = now.checked_add(ttl)?;
    conn.execute(
        "INSERT INTO entrylock (entry_id, created_at, expires_at, owned_by_ip)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            entry_id,
            encode_ts(now),
            encode_ts(expires_at),
            ip.unwrap_or("unknown"),
        ],
    )?;
    load_lock(conn, conn.last_insert_rowid())
}

const LOCK_SELECT: &str = "SELECT id, entry_id, created_at, expires_at, owned_by_ip,
    cancelled_at, cancelled_by_ip FROM entrylock";

fn load_lock(conn: &rusqlite::Connection, id: i64) -> Result<Lock> {
    conn.query_row(&format!("{LOCK_SELECT} WHERE id = ?1"), [id], decode_lock)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::LockNotFound(id),
            other => other.into(),
        })
}

fn decode_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
    let created_at: String = row.get(2)?;
    let expires_at: String = row.get(3)?;
    let cancelled_at: Option<String> = row.get(5)?;
    Ok(Lock {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        created_at: ts_column(2, &created_at)?,
        expires_at: ts_column(3, &expires_at)?,
        owned_by_ip: row.get(4)?,
        cancelled_at: cancelled_at
            .as_deref()
            .map(|raw| ts_column(5, raw))
            .transpose()?,
        cancelled_by_ip: row.get(6)?,
    })
}
