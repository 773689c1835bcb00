use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::MemoryConfig;
use crate::embedding::{Embedder, embedding_text};
use crate::error::{Result, deadline_exceeded_error};
use crate::index::IndexService;
use crate::model::{SyncOutcome, SyncStats};
use crate::note::memories_from_blob;
use crate::store::{FileLock, NoteChange, NotesStore};

/// Projects the notes store into the index. Holds nothing between runs;
/// progress lives in the index's sync checkpoint.
pub struct SyncService<'a> {
    store: &'a NotesStore,
    index: &'a IndexService,
    embedder: &'a dyn Embedder,
    lock_path: PathBuf,
    deadline: Option<Duration>,
}

impl<'a> SyncService<'a> {
    pub fn new(
        store: &'a NotesStore,
        index: &'a IndexService,
        embedder: &'a dyn Embedder,
        config: &MemoryConfig,
    ) -> Self {
        let mut lock_path = config.index_path.clone();
        lock_path.set_extension("sync.lock");
        Self {
            store,
            index,
            embedder,
            lock_path,
            deadline: None,
        }
    }

    /// Bound the wall-clock time a sync may run. On expiry the run stops
    /// between commits with a typed error; the checkpoint stays at the
    /// last fully projected commit.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Project one parsed note blob for a commit: upsert new and changed
    /// memories, delete the ones the blob no longer yields. Per-memory
    /// failures are absorbed into the error count.
    fn project_blob(&self, commit_sha: &str, blob: &str, stats: &mut SyncStats) -> Result<()> {
        let memories = memories_from_blob(blob, commit_sha);
        let existing_ids = self.index.ids_for_commit(commit_sha)?;
        let new_ids: HashSet<&str> = memories.iter().map(|m| m.id.as_str()).collect();

        for memory in &memories {
            stats.scanned += 1;
            let existing = self.index.get(&memory.id)?;
            match existing {
                Some(ref old) if old == memory => continue,
                Some(ref old) => {
                    // Re-embed only when the embedded text changed.
                    let needs_embedding =
                        old.summary != memory.summary || old.content != memory.content;
                    let result = if needs_embedding {
                        self.embed_and_store(memory)
                    } else {
                        self.index.update(memory, None)
                    };
                    match result {
                        Ok(()) => stats.updated += 1,
                        Err(e) => {
                            tracing::warn!("failed to update {}: {e}", memory.id);
                            stats.errors += 1;
                        }
                    }
                }
                None => match self.embed_and_store(memory) {
                    Ok(()) => stats.added += 1,
                    Err(e) => {
                        tracing::warn!("failed to index {}: {e}", memory.id);
                        stats.errors += 1;
                    }
                },
            }
        }

        for stale in existing_ids.iter().filter(|id| !new_ids.contains(id.as_str())) {
            self.index.delete(stale)?;
            stats.deleted += 1;
        }
        Ok(())
    }

    fn embed_and_store(&self, memory: &crate::model::Memory) -> Result<()> {
        let vector = self
            .embedder
            .embed(&embedding_text(&memory.summary, &memory.content))?;
        self.index.insert(memory, &vector)
    }

    fn delete_commit(&self, commit_sha: &str, stats: &mut SyncStats) -> Result<()> {
        for id in self.index.ids_for_commit(commit_sha)? {
            self.index.delete(&id)?;
            stats.deleted += 1;
        }
        Ok(())
    }

    /// Bring the index up to date with notes-ref commits newer than the
    /// checkpoint. The checkpoint advances only after all work for a
    /// commit succeeds, so a failed run resumes idempotently.
    pub fn incremental_sync(&self) -> Result<SyncOutcome> {
        let Some(_lock) = FileLock::try_acquire(&self.lock_path)? else {
            tracing::debug!("sync already in progress, bailing out");
            return Ok(SyncOutcome::InProgress);
        };

        let checkpoint = self.index.checkpoint()?;
        let commits = self
            .store
            .notes_commits_since(checkpoint.as_deref())?;
        let mut stats = SyncStats::default();
        let started = Instant::now();

        for notes_commit in &commits {
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    return Ok(SyncOutcome::Failed {
                        stats,
                        error: deadline_exceeded_error("incremental sync"),
                    });
                }
            }
            let result: Result<()> = (|| {
                for change in self.store.changed_notes(notes_commit)? {
                    match change {
                        NoteChange::Upserted { commit_sha, blob } => {
                            self.project_blob(&commit_sha, &blob, &mut stats)?;
                        }
                        NoteChange::Removed { commit_sha } => {
                            self.delete_commit(&commit_sha, &mut stats)?;
                        }
                    }
                }
                self.index.set_checkpoint(notes_commit)?;
                Ok(())
            })();
            if let Err(error) = result {
                tracing::warn!("sync stopped at notes commit {notes_commit}: {error}");
                return Ok(SyncOutcome::Failed { stats, error });
            }
        }

        tracing::info!(
            "incremental sync: +{} new, ~{} updated, -{} deleted ({} errors)",
            stats.added,
            stats.updated,
            stats.deleted,
            stats.errors
        );
        Ok(SyncOutcome::Completed(stats))
    }

    /// Rebuild the projection from scratch: every note on the ref is
    /// re-parsed and re-embedded, and index rows with no backing note are
    /// dropped. The checkpoint lands on the notes-ref tip.
    pub fn rebuild_sync(&self) -> Result<SyncOutcome> {
        let Some(_lock) = FileLock::try_acquire(&self.lock_path)? else {
            return Ok(SyncOutcome::InProgress);
        };

        let mut stats = SyncStats::default();
        let mut live_ids: HashSet<String> = HashSet::new();

        let result: Result<()> = (|| {
            for (commit_sha, blob) in self.store.iter_notes()? {
                for memory in memories_from_blob(&blob, &commit_sha) {
                    stats.scanned += 1;
                    live_ids.insert(memory.id.clone());
                    let existed = self.index.get(&memory.id)?.is_some();
                    match self.embed_and_store(&memory) {
                        Ok(()) if existed => stats.updated += 1,
                        Ok(()) => stats.added += 1,
                        Err(e) => {
                            tracing::warn!("failed to index {}: {e}", memory.id);
                            stats.errors += 1;
                        }
                    }
                }
            }
            for id in self.index.get_all_ids()? {
                if !live_ids.contains(&id) {
                    self.index.delete(&id)?;
                    stats.deleted += 1;
                }
            }
            if let Some(tip) = self.store.notes_tip()? {
                self.index.set_checkpoint(&tip)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(SyncOutcome::Completed(stats)),
            Err(error) => Ok(SyncOutcome::Failed { stats, error }),
        }
    }
}

/// Convenience for callers that treat an in-progress sync as a no-op and a
/// failure as an error.
pub fn stats_or_error(outcome: SyncOutcome) -> Result<SyncStats> {
    match outcome {
        SyncOutcome::Completed(stats) => Ok(stats),
        SyncOutcome::InProgress => Ok(SyncStats::default()),
        SyncOutcome::Failed { error, .. } => Err(error),
    }
}
