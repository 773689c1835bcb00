use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::index::IndexService;
use crate::model::{LifecycleStats, Memory, MemoryStatus};

/// Sentinel prefixed to compressed archived bodies.
pub const ARCHIVED_CONTENT_PREFIX: &str = "[ARCHIVED]";
/// Redacted summary left on tombstoned memories.
pub const TOMBSTONE_SUMMARY: &str = "[DELETED]";

const SCAN_BATCH_SIZE: usize = 100;

/// Deflate-compress a body for archival: zlib at `level`, base64 wrapped,
/// sentinel prefixed. Already-archived content passes through unchanged.
pub fn compress_content(content: &str, level: u32) -> Result<String> {
    if content.starts_with(ARCHIVED_CONTENT_PREFIX) {
        return Ok(content.to_string());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.clamp(1, 9)));
    encoder
        .write_all(content.as_bytes())
        .and_then(|()| encoder.finish())
        .map(|compressed| format!("{ARCHIVED_CONTENT_PREFIX}{}", BASE64.encode(compressed)))
        .map_err(|e| MemoryError::storage(format!("compression failed: {e}")))
}

/// Reverse `compress_content`. Content without the sentinel was never
/// compressed and passes through; a sentinel followed by garbage is a
/// typed parse failure.
pub fn decompress_content(content: &str) -> Result<String> {
    let Some(encoded) = content.strip_prefix(ARCHIVED_CONTENT_PREFIX) else {
        return Ok(content.to_string());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| MemoryError::parse(format!("archived content is not valid base64: {e}")))?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut body = String::new();
    decoder
        .read_to_string(&mut body)
        .map_err(|e| MemoryError::parse(format!("archived content failed to inflate: {e}")))?;
    Ok(body)
}

/// Size ratio of compressed to original; below 1 means it shrank.
pub fn get_compression_ratio(original: &str, compressed: &str) -> f64 {
    if original.is_empty() {
        return 1.0;
    }
    compressed.len() as f64 / original.len() as f64
}

/// Edges of the status state machine. Everything else is "not performed".
fn transition_permitted(from: MemoryStatus, to: MemoryStatus) -> bool {
    use MemoryStatus::*;
    matches!(
        (from, to),
        (Active, Resolved)
            | (Active, Archived)
            | (Active, Tombstone)
            | (Resolved, Archived)
            | (Archived, Tombstone)
            | (Archived, Active)
            | (Tombstone, Active)
    )
}

/// Age and relevance driven state machine over indexed memories, with
/// content compression on archive and GC of aged tombstones.
pub struct LifecycleManager {
    config: MemoryConfig,
}

impl LifecycleManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    /// Exponential falloff `2^(-age / half_life)` of a timestamp, 1.0 at
    /// or after `now`.
    pub fn calculate_temporal_decay(&self, timestamp: DateTime<Utc>) -> f64 {
        let age_days = (Utc::now() - timestamp).num_seconds().max(0) as f64 / 86_400.0;
        (2f64).powf(-age_days / self.config.half_life_days)
    }

    /// Days since the memory's timestamp, clamped at zero. Missing
    /// timestamps count as brand new.
    pub fn age_days(&self, memory: &Memory) -> f64 {
        match memory.timestamp {
            Some(ts) => (Utc::now() - ts).num_seconds().max(0) as f64 / 86_400.0,
            None => 0.0,
        }
    }

    /// Decayed relevance in `[min_decay, 1]`. A memory without a timestamp
    /// scores a neutral 0.5.
    pub fn relevance(&self, memory: &Memory) -> f64 {
        match memory.timestamp {
            Some(ts) => self
                .calculate_temporal_decay(ts)
                .clamp(self.config.min_decay, 1.0),
            None => 0.5,
        }
    }

    pub fn should_archive(&self, memory: &Memory) -> bool {
        memory.status == MemoryStatus::Active
            && self.age_days(memory) >= self.config.archive_age_days
            && self.relevance(memory) < self.config.min_relevance_for_active
    }

    pub fn should_tombstone(&self, memory: &Memory) -> bool {
        matches!(
            memory.status,
            MemoryStatus::Archived | MemoryStatus::Resolved
        ) && self.age_days(memory) >= self.config.tombstone_age_days
    }

    pub fn should_gc(&self, memory: &Memory) -> bool {
        memory.status == MemoryStatus::Tombstone
            && self.age_days(memory) >= self.config.gc_age_days
    }

    /// Move a memory to `target` if the edge is permitted, mutating the
    /// indexed row. Returns whether the transition was performed; an
    /// illegal edge is a no-op, not an error.
    fn transition(
        &self,
        index: &IndexService,
        id: &str,
        target: MemoryStatus,
    ) -> Result<bool> {
        let Some(mut memory) = index.get(id)? else {
            return Ok(false);
        };
        if !transition_permitted(memory.status, target) {
            return Ok(false);
        }
        match target {
            MemoryStatus::Archived => {
                memory.content =
                    compress_content(&memory.content, self.config.compression_level)?;
            }
            MemoryStatus::Tombstone => {
                // Tags are preserved for audit.
                memory.summary = TOMBSTONE_SUMMARY.to_string();
                memory.content = String::new();
            }
            MemoryStatus::Active => {
                memory.content = decompress_content(&memory.content)?;
            }
            MemoryStatus::Resolved => {}
        }
        memory.status = target;
        index.update(&memory, None)?;
        tracing::debug!("{id} -> {target}");
        Ok(true)
    }

    /// Mark resolved. Resolving an already resolved memory reports "not
    /// performed".
    pub fn resolve(&self, index: &IndexService, id: &str) -> Result<bool> {
        self.transition(index, id, MemoryStatus::Resolved)
    }

    /// Archive with body compression.
    pub fn archive(&self, index: &IndexService, id: &str) -> Result<bool> {
        self.transition(index, id, MemoryStatus::Archived)
    }

    /// Direct tombstone ("delete"): summary redacted, body cleared.
    pub fn delete(&self, index: &IndexService, id: &str) -> Result<bool> {
        self.transition(index, id, MemoryStatus::Tombstone)
    }

    /// Bring an archived or tombstoned memory back to active, inflating
    /// the body if it was compressed.
    pub fn restore(&self, index: &IndexService, id: &str) -> Result<bool> {
        self.transition(index, id, MemoryStatus::Active)
    }

    /// Archive a batch of ids. Illegal transitions count as skipped,
    /// per-item failures as errors.
    pub fn archive_batch(
        &self,
        index: &IndexService,
        ids: &[String],
        dry_run: bool,
    ) -> Result<LifecycleStats> {
        let mut stats = LifecycleStats::default();
        for id in ids {
            stats.scanned += 1;
            if dry_run {
                stats.archived += 1;
                continue;
            }
            match self.archive(index, id) {
                Ok(true) => stats.archived += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    tracing::warn!("archive of {id} failed: {e}");
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Walk every indexed memory in batches and apply the automatic
    /// transitions: archive stale active memories, age resolved ones into
    /// archived, tombstone old archives, and GC expired tombstones. The
    /// id snapshot is taken up front; memories created mid-scan wait for
    /// the next run.
    pub fn process_lifecycle(
        &self,
        index: &IndexService,
        dry_run: bool,
    ) -> Result<LifecycleStats> {
        let ids = index.get_all_ids()?;
        let mut stats = LifecycleStats::default();

        for chunk in ids.chunks(SCAN_BATCH_SIZE) {
            for memory in index.get_batch(chunk)? {
                stats.scanned += 1;
                if self.should_gc(&memory) {
                    if dry_run {
                        stats.deleted += 1;
                        continue;
                    }
                    match index.delete(&memory.id) {
                        Ok(()) => stats.deleted += 1,
                        Err(e) => {
                            tracing::warn!("gc of {} failed: {e}", memory.id);
                            stats.errors += 1;
                        }
                    }
                } else if self.should_archive(&memory) {
                    match self.apply(index, &memory.id, MemoryStatus::Archived, dry_run) {
                        Ok(true) => stats.archived += 1,
                        Ok(false) => stats.skipped += 1,
                        Err(e) => {
                            tracing::warn!("archive of {} failed: {e}", memory.id);
                            stats.errors += 1;
                        }
                    }
                } else if self.should_tombstone(&memory) {
                    // A resolved memory must pass through archived; it
                    // tombstones on a later scan.
                    let target = match memory.status {
                        MemoryStatus::Resolved => MemoryStatus::Archived,
                        _ => MemoryStatus::Tombstone,
                    };
                    match self.apply(index, &memory.id, target, dry_run) {
                        Ok(true) if target == MemoryStatus::Archived => stats.archived += 1,
                        Ok(true) => stats.tombstoned += 1,
                        Ok(false) => stats.skipped += 1,
                        Err(e) => {
                            tracing::warn!("lifecycle processing of {} failed: {e}", memory.id);
                            stats.errors += 1;
                        }
                    }
                } else {
                    stats.skipped += 1;
                }
            }
        }

        tracing::info!(
            "lifecycle{}: {} archived, {} tombstoned, {} deleted of {} scanned",
            if dry_run { " (dry run)" } else { "" },
            stats.archived,
            stats.tombstoned,
            stats.deleted,
            stats.scanned
        );
        Ok(stats)
    }

    fn apply(
        &self,
        index: &IndexService,
        id: &str,
        target: MemoryStatus,
        dry_run: bool,
    ) -> Result<bool> {
        if dry_run {
            return Ok(true);
        }
        self.transition(index, id, target)
    }

    /// Hard-delete tombstones past the GC age.
    pub fn garbage_collect(
        &self,
        index: &IndexService,
        dry_run: bool,
    ) -> Result<LifecycleStats> {
        let ids = index.get_all_ids()?;
        let mut stats = LifecycleStats::default();
        for chunk in ids.chunks(SCAN_BATCH_SIZE) {
            for memory in index.get_batch(chunk)? {
                stats.scanned += 1;
                if !self.should_gc(&memory) {
                    stats.skipped += 1;
                    continue;
                }
                if dry_run {
                    stats.deleted += 1;
                    continue;
                }
                match index.delete(&memory.id) {
                    Ok(()) => stats.deleted += 1,
                    Err(e) => {
                        tracing::warn!("gc of {} failed: {e}", memory.id);
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

static MANAGER: Mutex<Option<Arc<LifecycleManager>>> = Mutex::new(None);

/// Process-wide lifecycle manager, constructed lazily from `config`.
pub fn get_default_manager(config: &MemoryConfig) -> Arc<LifecycleManager> {
    let mut slot = MANAGER.lock().expect("lifecycle manager mutex poisoned");
    slot.get_or_insert_with(|| Arc::new(LifecycleManager::new(config.clone())))
        .clone()
}

pub fn reset_default_manager() {
    let mut slot = MANAGER.lock().expect("lifecycle manager mutex poisoned");
    *slot = None;
}
