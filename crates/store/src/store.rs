use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkferry_protocol::SessionStatus;
use chunkferry_transfer::ChunkPlan;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use crate::schema::migrate;
use crate::types::{ChunkRecord, NewSession, SessionRecord, dedup_key};
use crate::{Result, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "id, dedup_key, filename, total_size, chunk_size, total_chunks, \
     status, final_hash, failure_reason, created_at, updated_at, completed_at";

/// SQLite-backed store for sessions and their chunk rows.
///
/// All access goes through one connection behind a mutex; the multi-row
/// operations (create, claim, delete) run in their own transaction.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Opens (or creates) the database at `path` and migrates it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        migrate(&conn)?;
        info!(path = %path.display(), "session store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // A panic while holding the lock cannot leave a half-applied transaction
    // behind (rusqlite rolls back on drop), so a poisoned guard is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Creates a session in `UPLOADING` together with all of its `PENDING`
    /// chunk rows, in one transaction.
    ///
    /// Returns [`StoreError::DuplicateKey`] if a session with the same
    /// (filename, size) already exists.
    pub fn create_session(&self, new: &NewSession, now: DateTime<Utc>) -> Result<SessionRecord> {
        let plan = ChunkPlan::new(new.total_size, new.chunk_size)?;
        let now = truncate_millis(now);
        let record = SessionRecord {
            id: new.id.clone(),
            dedup_key: dedup_key(&new.filename, new.total_size),
            filename: new.filename.clone(),
            total_size: new.total_size,
            chunk_size: new.chunk_size,
            total_chunks: plan.total_chunks(),
            status: SessionStatus::Uploading,
            final_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO sessions (id, dedup_key, filename, total_size, chunk_size,
                                   total_chunks, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.id,
                record.dedup_key,
                record.filename,
                sql_int(record.total_size),
                sql_int(record.chunk_size),
                record.total_chunks,
                record.status.as_str(),
                now.timestamp_millis(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateKey(record.dedup_key));
            }
            Err(err) => return Err(err.into()),
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (session_id, chunk_index, status) VALUES (?1, ?2, 'PENDING')",
            )?;
            for index in 0..record.total_chunks {
                stmt.execute(params![record.id, index])?;
            }
        }
        tx.commit()?;

        debug!(
            session = %record.id,
            filename = %record.filename,
            total_chunks = record.total_chunks,
            "session created"
        );
        Ok(record)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn find_by_dedup_key(&self, key: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE dedup_key = ?1"),
                params![key],
                session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Moves an `UPLOADING` session with no pending chunks to `PROCESSING`.
    ///
    /// The check and the transition are one conditional update inside an
    /// immediate transaction. Returns `true` only for the caller that made
    /// the transition.
    pub fn claim_for_finalization(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE sessions SET status = 'PROCESSING', updated_at = ?2
             WHERE id = ?1 AND status = 'UPLOADING'
               AND NOT EXISTS (
                   SELECT 1 FROM chunks WHERE session_id = ?1 AND status != 'SUCCESS'
               )",
            params![id, now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    /// `PROCESSING -> COMPLETED`, recording the final hash.
    pub fn mark_completed(&self, id: &str, final_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE sessions
             SET status = 'COMPLETED', final_hash = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, final_hash, now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// `PROCESSING -> FAILED`, recording why.
    pub fn mark_failed(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE sessions SET status = 'FAILED', failure_reason = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, reason, now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Sessions abandoned in `UPLOADING` since before `uploading_before`, and
    /// sessions stuck in `PROCESSING` since before `processing_before`.
    pub fn stale_sessions(
        &self,
        uploading_before: DateTime<Utc>,
        processing_before: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE (status = 'UPLOADING' AND updated_at < ?1)
                OR (status = 'PROCESSING' AND updated_at < ?2)
             ORDER BY updated_at"
        ))?;
        let rows = stmt.query_map(
            params![
                uploading_before.timestamp_millis(),
                processing_before.timestamp_millis()
            ],
            session_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes a session and its chunk rows in one transaction.
    ///
    /// Returns `false` if the session did not exist.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM chunks WHERE session_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed == 1)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    pub fn chunk(&self, id: &str, index: u32) -> Result<Option<ChunkRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT session_id, chunk_index, status, received_at
                 FROM chunks WHERE session_id = ?1 AND chunk_index = ?2",
                params![id, index],
                chunk_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Indices of the chunks already marked `SUCCESS`, ascending.
    pub fn completed_indices(&self, id: &str) -> Result<Vec<u32>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT chunk_index FROM chunks
             WHERE session_id = ?1 AND status = 'SUCCESS'
             ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, u32>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// `PENDING -> SUCCESS` for one chunk, stamping `received_at`.
    ///
    /// Conditional on the chunk still being `PENDING`, so `received_at` is
    /// set exactly once. Returns `true` if this call made the transition.
    pub fn mark_chunk_success(&self, id: &str, index: u32, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ts = now.timestamp_millis();
        let changed = tx.execute(
            "UPDATE chunks SET status = 'SUCCESS', received_at = ?3
             WHERE session_id = ?1 AND chunk_index = ?2 AND status = 'PENDING'",
            params![id, index, ts],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![id, ts],
            )?;
        }
        tx.commit()?;
        Ok(changed == 1)
    }

    /// Number of chunks not yet `SUCCESS`.
    pub fn pending_count(&self, id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM chunks WHERE session_id = ?1 AND status != 'SUCCESS'",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of chunk rows for the session.
    pub fn chunk_count(&self, id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM chunks WHERE session_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        dedup_key: row.get(1)?,
        filename: row.get(2)?,
        total_size: row.get::<_, i64>(3)? as u64,
        chunk_size: row.get::<_, i64>(4)? as u64,
        total_chunks: row.get(5)?,
        status: parse_column(row, 6)?,
        final_hash: row.get(7)?,
        failure_reason: row.get(8)?,
        created_at: millis_column(row, 9)?,
        updated_at: millis_column(row, 10)?,
        completed_at: optional_millis_column(row, 11)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        session_id: row.get(0)?,
        index: row.get(1)?,
        status: parse_column(row, 2)?,
        received_at: optional_millis_column(row, 3)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn optional_millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

fn sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
