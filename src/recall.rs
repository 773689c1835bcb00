use crate::config::MemoryConfig;
use crate::embedding::{Embedder, embedding_text};
use crate::error::{MemoryError, Result};
use crate::index::{IndexService, SearchFilters};
use crate::model::{
    ALL_NAMESPACES, HydratedMemory, HydrationLevel, Memory, MemoryResult, Namespace, SpecContext,
};
use crate::store::NotesStore;

/// Read API over the index with hydration back into the notes store.
pub struct RecallService<'a> {
    store: &'a NotesStore,
    index: &'a IndexService,
    embedder: &'a dyn Embedder,
    config: &'a MemoryConfig,
}

impl<'a> RecallService<'a> {
    pub fn new(
        store: &'a NotesStore,
        index: &'a IndexService,
        embedder: &'a dyn Embedder,
        config: &'a MemoryConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            config,
        }
    }

    /// Semantic search. Embeds the query, runs KNN, and keeps results at
    /// or above `min_similarity` where `similarity = 1 / (1 + distance)`.
    /// An empty query returns nothing without touching the embedder.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        namespace: Option<Namespace>,
        spec: Option<&str>,
        min_similarity: Option<f64>,
    ) -> Result<Vec<MemoryResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(query)?;
        let filters = SearchFilters {
            namespace,
            spec: spec.map(String::from),
            ..SearchFilters::default()
        };
        let results = self.index.search_vector(&query_vec, k, &filters)?;
        Ok(results
            .into_iter()
            .map(|(memory, distance)| MemoryResult {
                memory,
                similarity: 1.0 / (1.0 + distance),
            })
            .filter(|r| min_similarity.is_none_or(|min| r.similarity >= min))
            .collect())
    }

    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
        namespace: Option<Namespace>,
        spec: Option<&str>,
    ) -> Result<Vec<Memory>> {
        let filters = SearchFilters {
            namespace,
            spec: spec.map(String::from),
            ..SearchFilters::default()
        };
        self.index.search_text(query, limit, &filters)
    }

    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        self.index.get(id)
    }

    pub fn get_batch(&self, ids: &[String]) -> Result<Vec<Memory>> {
        self.index.get_batch(ids)
    }

    pub fn get_by_namespace(
        &self,
        namespace: Namespace,
        spec: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        self.index.get_by_namespace(namespace, spec, limit)
    }

    pub fn get_by_spec(
        &self,
        spec: &str,
        namespace: Option<Namespace>,
        limit: Option<usize>,
    ) -> Result<Vec<Memory>> {
        self.index.get_by_spec(spec, namespace, limit)
    }

    pub fn list_recent(
        &self,
        limit: usize,
        namespace: Option<Namespace>,
        spec: Option<&str>,
    ) -> Result<Vec<Memory>> {
        self.index.list_recent(limit, namespace, spec)
    }

    /// Load the ancillary data a hydration level calls for. Optional parts
    /// (commit metadata) degrade to empty on failure; required parts (the
    /// raw note at `Full` and above) surface a recall error.
    pub fn hydrate(
        &self,
        memory: Memory,
        similarity: Option<f64>,
        level: HydrationLevel,
    ) -> Result<HydratedMemory> {
        let mut hydrated = HydratedMemory {
            memory,
            similarity,
            raw_note: None,
            commit: None,
            files: Vec::new(),
        };
        if level == HydrationLevel::Summary {
            return Ok(hydrated);
        }

        let commit_sha = hydrated.memory.commit_sha.clone();
        let raw = self
            .store
            .read_note(&commit_sha)
            .map_err(|e| MemoryError::recall(format!("failed to read note for {commit_sha}: {e}")))?
            .ok_or_else(|| {
                MemoryError::recall(format!("no note found for commit {commit_sha}"))
                    .with_recovery("run an incremental sync; the index may be ahead of the notes ref")
            })?;
        hydrated.raw_note = Some(raw);

        // Commit metadata is best effort.
        match self.store.commit_info(&commit_sha) {
            Ok(info) => hydrated.commit = Some(info),
            Err(e) => tracing::debug!("no commit info for {commit_sha}: {e}"),
        }

        // Dangling links are tolerated, but worth flagging.
        for related in &hydrated.memory.relates_to {
            if self.index.get(related)?.is_none() {
                tracing::warn!("{} relates_to missing memory {related}", hydrated.memory.id);
            }
        }

        if level == HydrationLevel::Files {
            hydrated.files = self
                .store
                .changed_files(&commit_sha)
                .map_err(|e| {
                    MemoryError::recall(format!("failed to load files for {commit_sha}: {e}"))
                })?;
        }
        Ok(hydrated)
    }

    /// Aggregate every memory for a spec, grouped by namespace, with a
    /// token estimate for the included summaries and bodies.
    pub fn get_spec_context(&self, spec: &str) -> Result<SpecContext> {
        let memories = self.index.get_by_spec(spec, None, None)?;
        let total = memories.len();

        let char_count: usize = memories
            .iter()
            .map(|m| m.summary.chars().count() + m.content.chars().count())
            .sum();
        let estimated_tokens = (char_count as f64 * self.config.tokens_per_char).ceil() as usize;

        let mut by_namespace = Vec::new();
        for namespace in ALL_NAMESPACES {
            let group: Vec<Memory> = memories
                .iter()
                .filter(|m| m.namespace == namespace)
                .cloned()
                .collect();
            if !group.is_empty() {
                by_namespace.push((namespace, group));
            }
        }

        Ok(SpecContext {
            spec: spec.to_string(),
            by_namespace,
            total,
            estimated_tokens,
        })
    }

    /// Find memories similar to an existing one by embedding its summary
    /// and body.
    pub fn recall_similar(
        &self,
        memory: &Memory,
        k: usize,
        exclude_self: bool,
    ) -> Result<Vec<MemoryResult>> {
        let text = embedding_text(&memory.summary, &memory.content);
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(&text)?;
        let fetch = if exclude_self { k + 1 } else { k };
        let results = self
            .index
            .search_vector(&query_vec, fetch, &SearchFilters::default())?;
        let mut out: Vec<MemoryResult> = results
            .into_iter()
            .filter(|(m, _)| !(exclude_self && m.id == memory.id))
            .map(|(m, distance)| MemoryResult {
                memory: m,
                similarity: 1.0 / (1.0 + distance),
            })
            .collect();
        out.truncate(k);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::model::{MemoryStatus, memory_id};
    use chrono::{TimeZone, Utc};
    use git2::{Repository, Signature};
    use std::path::Path;
    use tempfile::TempDir;

    const DIM: usize = 32;

    struct Fixture {
        _dir: TempDir,
        config: MemoryConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let sig = Signature::now("test", "test@test.com").unwrap();
            std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("a.txt")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        let config = MemoryConfig {
            repo_path: dir.path().to_path_buf(),
            index_path: dir.path().join(".mnemo/index.db"),
            embedding_dimension: DIM,
            ..MemoryConfig::default()
        };
        Fixture { _dir: dir, config }
    }

    fn memory(ns: Namespace, sha: &str, idx: usize, summary: &str, content: &str) -> Memory {
        Memory {
            id: memory_id(ns, sha, idx),
            commit_sha: sha.to_string(),
            namespace: ns,
            timestamp: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            summary: summary.to_string(),
            content: content.to_string(),
            spec: Some("auth".to_string()),
            tags: Vec::new(),
            phase: None,
            status: MemoryStatus::Active,
            relates_to: Vec::new(),
        }
    }

    fn index_memory(index: &IndexService, embedder: &HashingEmbedder, m: &Memory) {
        let vec = embedder
            .embed(&embedding_text(&m.summary, &m.content))
            .unwrap();
        index.insert(m, &vec).unwrap();
    }

    #[test]
    fn test_search_empty_query_returns_nothing() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        assert!(recall.search("", 5, None, None, None).unwrap().is_empty());
        assert!(recall.search("   ", 5, None, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_search_ranks_overlapping_text_higher() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        index_memory(
            &index,
            &embedder,
            &memory(Namespace::Decisions, "abc", 0, "database choice", "postgres database"),
        );
        index_memory(
            &index,
            &embedder,
            &memory(Namespace::Learnings, "abc", 1, "css layout", "flexbox grid"),
        );

        let results = recall.search("database", 5, None, None, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.summary, "database choice");
        assert!(results[0].similarity > results[1].similarity);
    }

    #[test]
    fn test_search_min_similarity_filters() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        index_memory(
            &index,
            &embedder,
            &memory(Namespace::Decisions, "abc", 0, "unrelated topic", "nothing shared"),
        );

        let strict = recall
            .search("database", 5, None, None, Some(0.99))
            .unwrap();
        assert!(strict.is_empty());
    }

    #[test]
    fn test_hydrate_levels() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        let head = store.head_commit().unwrap();
        store
            .write_note(&head, "---\ntype: decisions\n---\nnote body\n")
            .unwrap();
        let m = memory(Namespace::Decisions, &head, 0, "hydrate me", "body");
        index_memory(&index, &embedder, &m);

        let summary = recall
            .hydrate(m.clone(), None, HydrationLevel::Summary)
            .unwrap();
        assert!(summary.raw_note.is_none());
        assert!(summary.commit.is_none());

        let full = recall.hydrate(m.clone(), None, HydrationLevel::Full).unwrap();
        assert!(full.raw_note.unwrap().contains("note body"));
        let commit = full.commit.unwrap();
        assert_eq!(commit.author, "test");
        assert_eq!(commit.message, "initial");

        let files = recall.hydrate(m, None, HydrationLevel::Files).unwrap();
        assert_eq!(files.files.len(), 1);
        assert_eq!(files.files[0].path, "a.txt");
    }

    #[test]
    fn test_hydrate_full_without_note_is_a_recall_error() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        let head = store.head_commit().unwrap();
        let m = memory(Namespace::Decisions, &head, 0, "orphaned", "body");
        let err = recall.hydrate(m, None, HydrationLevel::Full).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Recall);
    }

    #[test]
    fn test_spec_context_groups_and_estimates() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        // 10 chars of summary + 10 of content per memory.
        index_memory(
            &index,
            &embedder,
            &memory(Namespace::Decisions, "abc", 0, "aaaaaaaaaa", "bbbbbbbbbb"),
        );
        index_memory(
            &index,
            &embedder,
            &memory(Namespace::Blockers, "abc", 1, "cccccccccc", "dddddddddd"),
        );

        let context = recall.get_spec_context("auth").unwrap();
        assert_eq!(context.total, 2);
        assert_eq!(context.by_namespace.len(), 2);
        // 40 chars at 0.25 tokens per char.
        assert_eq!(context.estimated_tokens, 10);

        let empty = recall.get_spec_context("nonexistent").unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.by_namespace.is_empty());
    }

    #[test]
    fn test_recall_similar_excludes_self() {
        let fx = fixture();
        let store = NotesStore::open(&fx.config).unwrap();
        let index = IndexService::open(&fx.config).unwrap();
        let embedder = HashingEmbedder::new(DIM);
        let recall = RecallService::new(&store, &index, &embedder, &fx.config);

        let a = memory(Namespace::Decisions, "abc", 0, "database choice", "postgres");
        let b = memory(Namespace::Decisions, "abc", 1, "database tuning", "postgres");
        index_memory(&index, &embedder, &a);
        index_memory(&index, &embedder, &b);

        let similar = recall.recall_similar(&a, 5, true).unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].memory.id, b.id);

        let with_self = recall.recall_similar(&a, 5, false).unwrap();
        assert_eq!(with_self.len(), 2);
    }
}
