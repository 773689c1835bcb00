use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, ToSql, Transaction, TransactionBehavior};
use zerocopy::IntoBytes;

use crate::config::MemoryConfig;
use crate::db::{initialize_db, open_index};
use crate::error::{Result, dimension_mismatch_error, index_locked_error};
use crate::model::{Memory, MemoryStatus, Namespace, split_delimited};
use crate::note::parse_timestamp;

const MAX_WRITE_ATTEMPTS: u32 = 5;
const CHECKPOINT_KEY: &str = "last_synced_commit";

const MEMORY_COLUMNS: &str = "m.id, m.commit_sha, m.namespace, m.timestamp, m.summary, \
     m.content, m.spec, m.tags, m.phase, m.status, m.relates_to";

/// Optional predicates applied to index queries.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub namespace: Option<Namespace>,
    pub spec: Option<String>,
    pub status: Option<MemoryStatus>,
    pub since_ts: Option<DateTime<Utc>>,
}

impl SearchFilters {
    fn predicates(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = String::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(ns) = self.namespace {
            clauses.push_str(" AND m.namespace = ?");
            params.push(Box::new(ns.as_str().to_string()));
        }
        if let Some(spec) = &self.spec {
            clauses.push_str(" AND m.spec = ?");
            params.push(Box::new(spec.clone()));
        }
        if let Some(status) = self.status {
            clauses.push_str(" AND m.status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if let Some(since) = self.since_ts {
            clauses.push_str(" AND m.timestamp >= ?");
            params.push(Box::new(format_ts(since)));
        }
        (clauses, params)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
    let namespace_str: String = row.get(2)?;
    let namespace: Namespace = namespace_str
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let timestamp: Option<String> = row.get(3)?;
    let status: String = row.get(9)?;
    Ok(Memory {
        id: row.get(0)?,
        commit_sha: row.get(1)?,
        namespace,
        timestamp: timestamp.as_deref().and_then(parse_timestamp),
        summary: row.get(4)?,
        content: row.get(5)?,
        spec: row.get(6)?,
        tags: split_delimited(row.get(7)?),
        phase: row.get(8)?,
        status: MemoryStatus::parse_or_active(&status),
        relates_to: split_delimited(row.get(10)?),
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Persistent secondary index over the notes store: scalar columns, a
/// full text index, and a vector index in one SQLite file. The notes ref
/// stays authoritative; everything here can be rebuilt from it.
pub struct IndexService {
    db: Connection,
    dimension: usize,
    // Serializes writers within the process; the file lock handles other
    // processes.
    write_lock: Mutex<()>,
}

impl IndexService {
    /// Open (creating if needed) the index file and its schema.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let db = open_index(&config.index_path)?;
        initialize_db(&db, config.embedding_dimension)?;
        Ok(Self {
            db,
            dimension: config.embedding_dimension,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Run a write closure inside an immediate transaction, retrying with
    /// exponential backoff while another writer holds the file.
    fn write_txn<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock().expect("index write mutex poisoned");
        let mut delay = Duration::from_millis(20);
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let result = (|| -> rusqlite::Result<T> {
                // Immediate takes the write lock up front instead of on the
                // first write statement, avoiding busy upgrade races with
                // other processes.
                let txn =
                    Transaction::new_unchecked(&self.db, TransactionBehavior::Immediate)?;
                let value = op(&txn)?;
                txn.commit()?;
                Ok(value)
            })();
            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    tracing::debug!("index busy on attempt {attempt}, backing off {delay:?}");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(index_locked_error())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(dimension_mismatch_error(embedding.len(), self.dimension));
        }
        Ok(())
    }

    fn upsert_row(conn: &Connection, memory: &Memory) -> rusqlite::Result<()> {
        conn.execute(
            "REPLACE INTO memories (id, commit_sha, namespace, timestamp, summary, content, \
             spec, tags, phase, status, relates_to) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                memory.id,
                memory.commit_sha,
                memory.namespace.as_str(),
                memory.timestamp.map(format_ts),
                memory.summary,
                memory.content,
                memory.spec,
                memory.tags_joined(),
                memory.phase,
                memory.status.as_str(),
                memory.relates_to_joined(),
            ],
        )?;
        // Delete first to get upsert behavior on the virtual table.
        conn.execute("DELETE FROM memories_fts WHERE id = ?", [&memory.id])?;
        conn.execute(
            "INSERT INTO memories_fts (id, summary, body) VALUES (?, ?, ?)",
            rusqlite::params![memory.id, memory.summary, memory.content],
        )?;
        Ok(())
    }

    /// Upsert a memory and its embedding. The embedding must match the
    /// dimension the index was initialized with.
    pub fn insert(&self, memory: &Memory, embedding: &[f32]) -> Result<()> {
        self.check_dimension(embedding)?;
        self.write_txn(|conn| {
            Self::upsert_row(conn, memory)?;
            conn.execute("DELETE FROM memories_vec WHERE memory_id = ?", [&memory.id])?;
            conn.execute(
                "INSERT INTO memories_vec (memory_id, embedding) VALUES (?, ?)",
                rusqlite::params![memory.id, embedding.as_bytes()],
            )?;
            Ok(())
        })
    }

    /// Upsert a memory's scalar fields. The existing embedding is kept
    /// unless the caller provides a replacement (it decides whether
    /// summary/content changed enough to re-embed).
    pub fn update(&self, memory: &Memory, embedding: Option<&[f32]>) -> Result<()> {
        if let Some(embedding) = embedding {
            return self.insert(memory, embedding);
        }
        self.write_txn(|conn| Self::upsert_row(conn, memory))
    }

    /// Remove a memory from all three indexes atomically.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.write_txn(|conn| {
            conn.execute("DELETE FROM memories WHERE id = ?", [id])?;
            conn.execute("DELETE FROM memories_fts WHERE id = ?", [id])?;
            conn.execute("DELETE FROM memories_vec WHERE memory_id = ?", [id])?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        let mut stmt = self
            .db
            .prepare(&format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?"))?;
        let mut rows = stmt.query_map([id], row_to_memory)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Fetch a batch of memories by id, preserving the requested order and
    /// silently omitting ids that are not indexed.
    pub fn get_batch(&self, ids: &[String]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids_json = serde_json::json!(ids).to_string();
        let mut stmt = self.db.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m \
             WHERE m.id IN (SELECT value FROM json_each(?))"
        ))?;
        let fetched = stmt
            .query_map([ids_json], row_to_memory)?
            .collect::<rusqlite::Result<Vec<Memory>>>()?;
        let mut by_id: HashMap<String, Memory> = fetched
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub fn get_all_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare("SELECT id FROM memories ORDER BY id")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Ids of all memories attached to a commit.
    pub fn ids_for_commit(&self, commit_sha: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT id FROM memories WHERE commit_sha = ? ORDER BY id")?;
        let ids = stmt
            .query_map([commit_sha], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// K-nearest-neighbor search in embedding space. Results are ordered
    /// by ascending distance because sqlite-vec only supports ascending
    /// distance; post-filter shortfall below k is expected.
    pub fn search_vector(
        &self,
        query_vec: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(Memory, f64)>> {
        self.check_dimension(query_vec)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let (clauses, filter_params) = filters.predicates();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS}, distance \
             FROM memories_vec \
             JOIN memories m ON m.id = memory_id \
             WHERE embedding MATCH ? AND k = ?{clauses} \
             ORDER BY distance"
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(filter_params.len() + 2);
        params.push(Box::new(query_vec.as_bytes().to_vec()));
        params.push(Box::new(k as i64));
        params.extend(filter_params);

        let mut stmt = self.db.prepare(&sql)?;
        let results = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), |row| {
                let memory = row_to_memory(row)?;
                let distance: f64 = row.get(11)?;
                Ok((memory, distance))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Full text match over summary and body using FTS5 query syntax.
    /// Empty or whitespace queries return nothing.
    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Memory>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let (clauses, filter_params) = filters.predicates();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} \
             FROM memories_fts f \
             JOIN memories m ON m.id = f.id \
             WHERE memories_fts MATCH ?{clauses} \
             ORDER BY rank LIMIT ?"
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(filter_params.len() + 2);
        params.push(Box::new(query.to_string()));
        params.extend(filter_params);
        params.push(Box::new(limit as i64));

        let mut stmt = self.db.prepare(&sql)?;
        let results = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), row_to_memory)?
            .collect::<rusqlite::Result<Vec<Memory>>>()?;
        Ok(results)
    }

    fn filtered_list(
        &self,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        let (clauses, filter_params) = filters.predicates();
        let limit_clause = match limit {
            Some(_) => " LIMIT ?",
            None => "",
        };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m \
             WHERE 1=1{clauses} ORDER BY m.timestamp DESC{limit_clause}"
        );
        let mut params = filter_params;
        if let Some(limit) = limit {
            params.push(Box::new(limit as i64));
        }
        let mut stmt = self.db.prepare(&sql)?;
        let results = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), row_to_memory)?
            .collect::<rusqlite::Result<Vec<Memory>>>()?;
        Ok(results)
    }

    pub fn get_by_namespace(
        &self,
        namespace: Namespace,
        spec: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        self.filtered_list(
            &SearchFilters {
                namespace: Some(namespace),
                spec: spec.map(String::from),
                ..SearchFilters::default()
            },
            limit,
        )
    }

    pub fn get_by_spec(
        &self,
        spec: &str,
        namespace: Option<Namespace>,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        self.filtered_list(
            &SearchFilters {
                namespace,
                spec: Some(spec.to_string()),
                ..SearchFilters::default()
            },
            limit,
        )
    }

    pub fn list_recent(
        &self,
        limit: usize,
        namespace: Option<Namespace>,
        spec: Option<&str>,
    ) -> Result<Vec<Memory>> {
        self.filtered_list(
            &SearchFilters {
                namespace,
                spec: spec.map(String::from),
                ..SearchFilters::default()
            },
            Some(limit),
        )
    }

    /// Last fully indexed commit on the notes ref.
    pub fn checkpoint(&self) -> Result<Option<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT value FROM sync_state WHERE key = ?")?;
        let mut rows = stmt.query_map([CHECKPOINT_KEY], |r| r.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn set_checkpoint(&self, commit_sha: &str) -> Result<()> {
        self.write_txn(|conn| {
            conn.execute(
                "REPLACE INTO sync_state (key, value) VALUES (?, ?)",
                rusqlite::params![CHECKPOINT_KEY, commit_sha],
            )?;
            Ok(())
        })
    }
}
