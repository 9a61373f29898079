use rusqlite::Connection;
use tracing::debug;

/// Version stamped into `PRAGMA user_version` after migration.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id             TEXT PRIMARY KEY,
    dedup_key      TEXT NOT NULL UNIQUE,
    filename       TEXT NOT NULL,
    total_size     INTEGER NOT NULL,
    chunk_size     INTEGER NOT NULL,
    total_chunks   INTEGER NOT NULL,
    status         TEXT NOT NULL
                   CHECK (status IN ('UPLOADING', 'PROCESSING', 'COMPLETED', 'FAILED')),
    final_hash     TEXT,
    failure_reason TEXT,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL,
    completed_at   INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_status_updated
    ON sessions (status, updated_at);

CREATE TABLE IF NOT EXISTS chunks (
    session_id  TEXT NOT NULL REFERENCES sessions (id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('PENDING', 'SUCCESS')),
    received_at INTEGER,
    UNIQUE (session_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_session_status
    ON chunks (session_id, status);
";

/// Applies connection pragmas and brings the schema up to [`SCHEMA_VERSION`].
pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;

    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < 1 {
        debug!(from = version, to = SCHEMA_VERSION, "migrating session schema");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
