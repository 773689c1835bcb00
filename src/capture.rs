use chrono::{DateTime, Utc};

use crate::config::MemoryConfig;
use crate::error::{Result, content_too_large_error, summary_too_long_error};
use crate::model::{Memory, MemoryStatus, Namespace, memory_id};
use crate::note::{memories_from_blob, serialize_memory};
use crate::store::NotesStore;

/// A prospective memory before validation.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub namespace: String,
    /// Defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    pub summary: String,
    pub content: String,
    pub spec: Option<String>,
    pub tags: Vec<String>,
    pub phase: Option<String>,
    pub relates_to: Vec<String>,
    /// Target commit sha; defaults to `HEAD`.
    pub commit: Option<String>,
}

/// Validates a prospective memory and appends it to the notes store under
/// the cross-process write lock. Indexing is not done inline; the next
/// incremental sync picks the write up.
pub struct CaptureService<'a> {
    store: &'a NotesStore,
    config: &'a MemoryConfig,
}

impl<'a> CaptureService<'a> {
    pub fn new(store: &'a NotesStore, config: &'a MemoryConfig) -> Self {
        Self { store, config }
    }

    /// Validate and append. Returns the new memory's id.
    pub fn capture(&self, request: CaptureRequest) -> Result<String> {
        let namespace: Namespace = request.namespace.parse()?;

        let summary_chars = request.summary.chars().count();
        if summary_chars > self.config.max_summary_chars {
            return Err(summary_too_long_error(
                summary_chars,
                self.config.max_summary_chars,
            ));
        }
        let content_bytes = request.content.len();
        if content_bytes > self.config.max_content_bytes {
            return Err(content_too_large_error(
                content_bytes,
                self.config.max_content_bytes,
            ));
        }

        let commit_sha = self.store.resolve_commit(request.commit.as_deref())?;

        let _lock = self.store.lock_for_write()?;

        // The memory's index is its block position among the valid blocks
        // already attached to the commit; capture only ever appends.
        let existing = self.store.read_note(&commit_sha)?;
        let next_index = existing
            .as_deref()
            .map(|blob| memories_from_blob(blob, &commit_sha).len())
            .unwrap_or(0);

        let memory = Memory {
            id: memory_id(namespace, &commit_sha, next_index),
            commit_sha: commit_sha.clone(),
            namespace,
            timestamp: Some(request.timestamp.unwrap_or_else(Utc::now)),
            summary: request.summary,
            content: request.content,
            spec: request.spec,
            tags: request.tags,
            phase: request.phase,
            status: MemoryStatus::Active,
            relates_to: request.relates_to,
        };

        let block = serialize_memory(&memory)?;
        let blob = match existing {
            Some(mut blob) => {
                if !blob.ends_with('\n') {
                    blob.push('\n');
                }
                blob.push_str(&block);
                blob
            }
            None => block,
        };
        self.store.write_note(&commit_sha, &blob)?;
        tracing::info!("captured {}", memory.id);
        Ok(memory.id)
    }
}
