use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, invalid_namespace_error};

/// Closed set of memory namespaces. The namespace drives ranking priority
/// and pattern classification hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Inception,
    Decisions,
    Learnings,
    Progress,
    Blockers,
    Patterns,
}

pub const ALL_NAMESPACES: [Namespace; 6] = [
    Namespace::Inception,
    Namespace::Decisions,
    Namespace::Learnings,
    Namespace::Progress,
    Namespace::Blockers,
    Namespace::Patterns,
];

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Inception => "inception",
            Namespace::Decisions => "decisions",
            Namespace::Learnings => "learnings",
            Namespace::Progress => "progress",
            Namespace::Blockers => "blockers",
            Namespace::Patterns => "patterns",
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        ALL_NAMESPACES.iter().map(|n| n.as_str()).collect()
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inception" => Ok(Namespace::Inception),
            "decisions" => Ok(Namespace::Decisions),
            "learnings" => Ok(Namespace::Learnings),
            "progress" => Ok(Namespace::Progress),
            "blockers" => Ok(Namespace::Blockers),
            "patterns" => Ok(Namespace::Patterns),
            other => Err(invalid_namespace_error(other, &Namespace::valid_names())),
        }
    }
}

/// Lifecycle status of a memory. Transitions between statuses are owned by
/// the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Active,
    Resolved,
    Archived,
    Tombstone,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Resolved => "resolved",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Tombstone => "tombstone",
        }
    }

    /// Lenient parse used when reading notes and index rows. Unknown
    /// statuses fall back to active rather than failing the read.
    pub fn parse_or_active(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "resolved" => MemoryStatus::Resolved,
            "archived" => MemoryStatus::Archived,
            "tombstone" => MemoryStatus::Tombstone,
            _ => MemoryStatus::Active,
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the stable id for a memory from its coordinates.
pub fn memory_id(namespace: Namespace, commit_sha: &str, index: usize) -> String {
    format!("{}:{}:{}", namespace.as_str(), commit_sha, index)
}

/// One note attached to one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub commit_sha: String,
    pub namespace: Namespace,
    pub timestamp: Option<DateTime<Utc>>,
    pub summary: String,
    pub content: String,
    pub spec: Option<String>,
    pub tags: Vec<String>,
    pub phase: Option<String>,
    pub status: MemoryStatus,
    pub relates_to: Vec<String>,
}

impl Memory {
    /// Tags as the comma separated string stored in the index.
    pub fn tags_joined(&self) -> Option<String> {
        if self.tags.is_empty() {
            None
        } else {
            Some(self.tags.join(","))
        }
    }

    pub fn relates_to_joined(&self) -> Option<String> {
        if self.relates_to.is_empty() {
            None
        } else {
            Some(self.relates_to.join(","))
        }
    }
}

/// Split a comma delimited index column back into the list form.
pub fn split_delimited(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// A search hit: the memory plus its similarity to the query, where
/// `similarity = 1 / (1 + distance)`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryResult {
    pub memory: Memory,
    pub similarity: f64,
}

/// Commit metadata attached during hydration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub message: String,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Snapshot of one file changed by the memory's commit.
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub path: String,
    pub content: String,
}

/// How much ancillary data accompanies a returned memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HydrationLevel {
    /// The memory record as indexed.
    Summary,
    /// Adds the raw note text and commit metadata.
    Full,
    /// Adds snapshots of the files the commit changed.
    Files,
}

/// A memory with the extra data its hydration level called for.
#[derive(Debug, Clone, Serialize)]
pub struct HydratedMemory {
    pub memory: Memory,
    pub similarity: Option<f64>,
    pub raw_note: Option<String>,
    pub commit: Option<CommitInfo>,
    pub files: Vec<FileSnapshot>,
}

/// All memories for a spec grouped by namespace, with a token estimate for
/// feeding the aggregate into a model context.
#[derive(Debug, Clone, Serialize)]
pub struct SpecContext {
    pub spec: String,
    pub by_namespace: Vec<(Namespace, Vec<Memory>)>,
    pub total: usize,
    pub estimated_tokens: usize,
}

/// Status of a distilled pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    Candidate,
    Validated,
    Promoted,
    Deprecated,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Candidate => "candidate",
            PatternStatus::Validated => "validated",
            PatternStatus::Promoted => "promoted",
            PatternStatus::Deprecated => "deprecated",
        }
    }
}

/// Classification of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Success,
    AntiPattern,
    Workflow,
    Decision,
    Technical,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Success => "success",
            PatternType::AntiPattern => "anti_pattern",
            PatternType::Workflow => "workflow",
            PatternType::Decision => "decision",
            PatternType::Technical => "technical",
        }
    }

    /// Title-case label used in generated pattern names.
    pub fn label(&self) -> &'static str {
        match self {
            PatternType::Success => "Success",
            PatternType::AntiPattern => "Anti-Pattern",
            PatternType::Workflow => "Workflow",
            PatternType::Decision => "Decision",
            PatternType::Technical => "Technical",
        }
    }
}

/// A distilled observation mined from clusters of memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub pattern_type: PatternType,
    pub description: String,
    pub tags: Vec<String>,
    pub evidence: Vec<String>,
    pub confidence: f64,
    pub status: PatternStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: usize,
}

/// Counters returned by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub scanned: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: usize,
}

/// Result of requesting a sync. A mid-run failure still reports the work
/// completed before it; the checkpoint stays at the last fully projected
/// commit.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncStats),
    Failed {
        stats: SyncStats,
        error: crate::error::MemoryError,
    },
    /// Another process holds the sync lock; nothing was done.
    InProgress,
}

/// Counters returned by lifecycle batch operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    pub scanned: usize,
    pub archived: usize,
    pub tombstoned: usize,
    pub deleted: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl LifecycleStats {
    pub fn processed(&self) -> usize {
        self.archived + self.tombstoned + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_namespace_round_trip() {
        for ns in ALL_NAMESPACES {
            assert_eq!(Namespace::from_str(ns.as_str()).unwrap(), ns);
        }
    }

    #[test]
    fn test_invalid_namespace_enumerates_valid_set() {
        let err = Namespace::from_str("musings").unwrap_err();
        for name in Namespace::valid_names() {
            assert!(err.message.contains(name), "missing {name} in {}", err.message);
        }
    }

    #[test]
    fn test_memory_id_format() {
        assert_eq!(
            memory_id(Namespace::Decisions, "abc123", 2),
            "decisions:abc123:2"
        );
    }

    #[test]
    fn test_split_delimited() {
        assert_eq!(
            split_delimited(Some("a, b,c".into())),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_delimited(None).is_empty());
        assert!(split_delimited(Some("".into())).is_empty());
    }

    #[test]
    fn test_lifecycle_stats_processed() {
        let stats = LifecycleStats {
            scanned: 10,
            archived: 2,
            tombstoned: 3,
            deleted: 1,
            errors: 0,
            skipped: 4,
        };
        assert_eq!(stats.processed(), 6);
    }
}
