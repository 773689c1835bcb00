use std::fs;
use std::path::Path;

use rusqlite::{Connection, ffi::sqlite3_auto_extension};
use sqlite_vec::sqlite3_vec_init;

use crate::error::{Result, schema_version_error, vec_extension_missing_error};

/// Bumped when the table layout changes. There is no online migration:
/// a version mismatch means "delete the file and rebuild from notes".
pub const SCHEMA_VERSION: i64 = 1;

/// Open the single-file index db with the sqlite-vec extension loaded.
pub fn open_index(path: &Path) -> Result<Connection> {
    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut i8,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> i32,
        >(sqlite3_vec_init as *const ())));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let db = Connection::open(path)?;
    // Single-writer multi-reader semantics; readers only block briefly.
    db.pragma_update(None, "journal_mode", "WAL")?;
    db.busy_timeout(std::time::Duration::from_millis(250))?;
    Ok(db)
}

/// Create the schema. Safe to run multiple times against the same file;
/// fails fast if the vector extension is unavailable or the file was
/// written by a different schema version.
pub fn initialize_db(db: &Connection, embedding_dimension: usize) -> Result<()> {
    // Scalar projection of each memory. All other indexes refer to rows
    // here by id, so it is always safe to query an index and then hydrate
    // by id.
    db.execute(
        r"CREATE TABLE IF NOT EXISTS memories (
    -- {namespace}:{commit_sha}:{index} of the memory
    id TEXT PRIMARY KEY,
    commit_sha TEXT NOT NULL,
    namespace TEXT NOT NULL,
    -- RFC 3339 UTC, sorts lexicographically
    timestamp TEXT,
    summary TEXT NOT NULL,
    -- Markdown body
    content TEXT NOT NULL,
    spec TEXT,
    -- Comma separated string of tags
    tags TEXT,
    phase TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    -- Comma separated string of related memory ids
    relates_to TEXT
);",
        [],
    )?;
    db.execute_batch(
        r"CREATE INDEX IF NOT EXISTS idx_memories_namespace ON memories(namespace);
CREATE INDEX IF NOT EXISTS idx_memories_spec ON memories(spec);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp);
CREATE INDEX IF NOT EXISTS idx_memories_commit ON memories(commit_sha);",
    )?;

    // Full text index over summary and body.
    db.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id UNINDEXED,
    summary,
    body
);",
        [],
    )?;

    // Vector virtual table for similarity search. Dimensionality is fixed
    // here for the life of the file.
    let create_vec = db.execute(
        &format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
    memory_id TEXT PRIMARY KEY,
    embedding float[{embedding_dimension}]
);"
        ),
        [],
    );
    if let Err(e) = create_vec {
        return Err(vec_extension_missing_error(&e.to_string()));
    }

    db.execute(
        "CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT
);",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER);",
        [],
    )?;
    let version: Option<i64> = db
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    match version {
        None => {
            db.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => return Err(schema_version_error(v, SCHEMA_VERSION)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open_index(&dir.path().join("index.db")).unwrap();
        initialize_db(&db, 8).unwrap();
        initialize_db(&db, 8).unwrap();

        let version: i64 = db
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open_index(&dir.path().join("index.db")).unwrap();
        initialize_db(&db, 8).unwrap();
        db.execute("UPDATE schema_version SET version = 99", []).unwrap();
        let err = initialize_db(&db, 8).unwrap_err();
        assert!(err.message.contains("schema version"));
        assert!(err.recovery.as_deref().unwrap_or("").contains("rebuild"));
    }
}
