use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use itertools::Itertools;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::model::{Memory, Namespace};
use crate::recall::RecallService;

/// Fixed synonym table for query expansion.
fn synonym_table() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        ("db", vec!["database", "storage"]),
        ("database", vec!["db", "storage", "sql"]),
        ("bug", vec!["error", "defect", "issue"]),
        ("error", vec!["bug", "failure", "exception"]),
        ("fix", vec!["repair", "resolve", "patch"]),
        ("auth", vec!["authentication", "login"]),
        ("config", vec!["configuration", "settings"]),
        ("test", vec!["testing", "spec", "verify"]),
        ("deploy", vec!["release", "ship", "rollout"]),
        ("perf", vec!["performance", "latency", "speed"]),
        ("docs", vec!["documentation", "readme"]),
        ("api", vec!["endpoint", "interface"]),
        ("cache", vec!["caching", "memoize"]),
        ("refactor", vec!["cleanup", "restructure"]),
    ])
}

/// Domain expansions layered on top of the synonym table when enabled.
fn domain_table() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        ("frontend", vec!["react", "vue", "ui"]),
        ("backend", vec!["server", "api", "service"]),
        ("database", vec!["postgres", "schema", "migration"]),
        ("infra", vec!["docker", "kubernetes", "terraform"]),
        ("testing", vec!["unit", "integration", "fixture"]),
    ])
}

/// An expanded query plus the filters it will run with. `cache_key` is a
/// deterministic digest of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub original: String,
    pub expanded_terms: Vec<String>,
    pub filters: Vec<(String, String)>,
}

impl SearchQuery {
    /// 16 hex chars of the SHA-256 over original, sorted expansions, and
    /// sorted filter items.
    pub fn cache_key(&self) -> String {
        let mut expansions: Vec<&str> = self.expanded_terms.iter().map(String::as_str).collect();
        expansions.sort_unstable();
        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        filters.sort_unstable();

        let canonical = format!(
            "{}|{}|{}",
            self.original,
            expansions.join(","),
            filters.join(",")
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }
}

/// Expands a query with synonyms and optional domain terms.
pub struct QueryExpander {
    synonyms: HashMap<&'static str, Vec<&'static str>>,
    domain: HashMap<&'static str, Vec<&'static str>>,
    use_domain_expansions: bool,
    max_expansions: usize,
}

impl QueryExpander {
    pub fn new(max_expansions: usize, use_domain_expansions: bool) -> Self {
        Self {
            synonyms: synonym_table(),
            domain: domain_table(),
            use_domain_expansions,
            max_expansions,
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 1)
            .map(String::from)
            .collect()
    }

    /// Expand `query` into a `SearchQuery`. Total expansions are capped at
    /// `max_expansions * 2`; the original tokens are never repeated as
    /// expansions.
    pub fn expand(&self, query: &str, filters: Vec<(String, String)>) -> SearchQuery {
        let tokens = Self::tokenize(query);
        let cap = self.max_expansions * 2;
        let mut expanded: Vec<String> = Vec::new();
        let mut seen: BTreeSet<&str> = tokens.iter().map(String::as_str).collect();

        for token in &tokens {
            let mut candidates: Vec<&'static str> = Vec::new();
            if let Some(syns) = self.synonyms.get(token.as_str()) {
                candidates.extend(syns);
            }
            if self.use_domain_expansions {
                if let Some(extra) = self.domain.get(token.as_str()) {
                    candidates.extend(extra);
                }
            }
            for candidate in candidates {
                if expanded.len() >= cap {
                    break;
                }
                if seen.insert(candidate) {
                    expanded.push(candidate.to_string());
                }
            }
        }

        SearchQuery {
            original: query.to_string(),
            expanded_terms: expanded,
            filters,
        }
    }
}

/// Per-factor contributions, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RankFactors {
    pub recency: f64,
    pub namespace: f64,
    pub spec: f64,
    pub tags: f64,
}

/// One reranked result. `boosted_score` is lower-is-better, like the
/// distance it is derived from.
#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub memory: Memory,
    pub original_score: f64,
    pub boosted_score: f64,
    pub rank_factors: RankFactors,
}

/// Weights applied to each rank factor when boosting. All zeros leaves the
/// ordering unchanged.
#[derive(Debug, Clone, Copy)]
pub struct RerankWeights {
    pub recency: f64,
    pub namespace: f64,
    pub spec: f64,
    pub tags: f64,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            recency: 0.25,
            namespace: 0.25,
            spec: 0.25,
            tags: 0.25,
        }
    }
}

/// The ranking target: what the caller is currently working on.
#[derive(Debug, Clone, Default)]
pub struct RerankTarget {
    pub namespace: Option<Namespace>,
    pub spec: Option<String>,
    pub tags: Vec<String>,
}

/// Reorders raw distance-scored results with recency, namespace, spec and
/// tag signals.
pub struct ResultReranker {
    weights: RerankWeights,
    half_life_days: f64,
}

impl ResultReranker {
    pub fn new(weights: RerankWeights, half_life_days: f64) -> Self {
        Self {
            weights,
            half_life_days,
        }
    }

    fn recency_factor(&self, memory: &Memory) -> f64 {
        let Some(ts) = memory.timestamp else {
            return 0.0;
        };
        // Future timestamps clamp to age zero, scoring 1.
        let age_days = (Utc::now() - ts).num_seconds().max(0) as f64 / 86_400.0;
        (2f64).powf(-age_days / self.half_life_days)
    }

    fn namespace_factor(&self, memory: &Memory, target: &RerankTarget) -> f64 {
        let priority = match memory.namespace {
            Namespace::Decisions => 1.0,
            Namespace::Learnings => 0.9,
            Namespace::Blockers => 0.8,
            Namespace::Progress => 0.7,
            _ => 0.5,
        };
        if target.namespace == Some(memory.namespace) {
            (priority + 0.2f64).min(1.0)
        } else {
            priority
        }
    }

    fn spec_factor(&self, memory: &Memory, target: &RerankTarget) -> f64 {
        match (&memory.spec, &target.spec) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        }
    }

    fn tags_factor(&self, memory: &Memory, target: &RerankTarget) -> f64 {
        if memory.tags.is_empty() || target.tags.is_empty() {
            return 0.0;
        }
        let result_tags: BTreeSet<&str> = memory.tags.iter().map(String::as_str).collect();
        let target_tags: BTreeSet<&str> = target.tags.iter().map(String::as_str).collect();
        let intersection = result_tags.intersection(&target_tags).count();
        let union = result_tags.union(&target_tags).count();
        intersection as f64 / union as f64
    }

    /// Boost and sort results ascending by boosted score. Ties on the
    /// clamped score order by larger total boost, so a fully matching
    /// result stays ahead of a non matching one when both floor at zero.
    pub fn rerank(&self, results: Vec<(Memory, f64)>, target: &RerankTarget) -> Vec<RankedResult> {
        let mut ranked: Vec<(RankedResult, f64)> = results
            .into_iter()
            .map(|(memory, distance)| {
                let factors = RankFactors {
                    recency: self.recency_factor(&memory),
                    namespace: self.namespace_factor(&memory, target),
                    spec: self.spec_factor(&memory, target),
                    tags: self.tags_factor(&memory, target),
                };
                let boost = self.weights.recency * factors.recency
                    + self.weights.namespace * factors.namespace
                    + self.weights.spec * factors.spec
                    + self.weights.tags * factors.tags;
                (
                    RankedResult {
                        boosted_score: (distance - boost).max(0.0),
                        original_score: distance,
                        rank_factors: factors,
                        memory,
                    },
                    boost,
                )
            })
            .collect();

        ranked.sort_by(|(a, boost_a), (b, boost_b)| {
            a.boosted_score
                .partial_cmp(&b.boosted_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| boost_b.partial_cmp(boost_a).unwrap_or(Ordering::Equal))
        });
        ranked.into_iter().map(|(r, _)| r).collect()
    }
}

struct CacheEntry {
    results: Vec<RankedResult>,
    inserted_at: Instant,
}

/// Current shape of the cache, for introspection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

/// Bounded LRU of reranked result lists with per-entry TTL.
pub struct SearchCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: usize,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Cloned results if present and unexpired. Expired entries are purged
    /// on access; a hit moves the key to most recently used.
    pub fn get(&self, key: &str) -> Option<Vec<RankedResult>> {
        let mut entries = self.entries.lock().expect("search cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.results.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert or update. The least recently used entry is evicted on
    /// overflow. Caching an empty result list is valid.
    pub fn set(&self, key: &str, results: Vec<RankedResult>) {
        let mut entries = self.entries.lock().expect("search cache mutex poisoned");
        entries.put(
            key.to_string(),
            CacheEntry {
                results,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove entries whose key contains `pattern`, or everything when no
    /// pattern is given. Returns the number removed.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries.lock().expect("search cache mutex poisoned");
        match pattern {
            None => {
                let removed = entries.len();
                entries.clear();
                removed
            }
            Some(pattern) => {
                let keys: Vec<String> = entries
                    .iter()
                    .filter(|(k, _)| k.contains(pattern))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &keys {
                    entries.pop(key);
                }
                keys.len()
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("search cache mutex poisoned");
        CacheStats {
            size: entries.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

/// Query expansion, reranking and caching in front of recall.
pub struct SearchOptimizer {
    expander: QueryExpander,
    reranker: ResultReranker,
    cache: SearchCache,
}

impl SearchOptimizer {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            expander: QueryExpander::new(config.max_expansions, true),
            reranker: ResultReranker::new(RerankWeights::default(), config.half_life_days),
            cache: SearchCache::new(
                config.cache_max_size,
                Duration::from_secs(config.cache_ttl_seconds),
            ),
        }
    }

    pub fn expander(&self) -> &QueryExpander {
        &self.expander
    }

    pub fn reranker(&self) -> &ResultReranker {
        &self.reranker
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    fn target_filters(target: &RerankTarget) -> Vec<(String, String)> {
        let mut filters = Vec::new();
        if let Some(ns) = target.namespace {
            filters.push(("namespace".to_string(), ns.as_str().to_string()));
        }
        if let Some(spec) = &target.spec {
            filters.push(("spec".to_string(), spec.clone()));
        }
        filters
    }

    /// Optimized search: expand, check the cache, run semantic search,
    /// top up from full text over the expanded terms when semantic search
    /// comes back short, rerank, and cache the outcome.
    pub fn search(
        &self,
        recall: &RecallService,
        query: &str,
        k: usize,
        target: &RerankTarget,
    ) -> Result<Vec<RankedResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let search_query = self.expander.expand(query, Self::target_filters(target));
        let key = search_query.cache_key();
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!("search cache hit for {key}");
            return Ok(cached);
        }

        let semantic = recall.search(query, k, target.namespace, target.spec.as_deref(), None)?;
        let mut raw: Vec<(Memory, f64)> = semantic
            .into_iter()
            .map(|r| {
                let distance = 1.0 / r.similarity - 1.0;
                (r.memory, distance)
            })
            .collect();

        if raw.len() < k && !search_query.expanded_terms.is_empty() {
            // Keyword misses may still hit on a synonym; text hits rank
            // behind vector hits via a flat fallback distance.
            let fts_query = search_query
                .expanded_terms
                .iter()
                .map(|t| format!("\"{t}\""))
                .join(" OR ");
            let supplement = recall.search_text(
                &fts_query,
                k - raw.len(),
                target.namespace,
                target.spec.as_deref(),
            )?;
            raw.extend(supplement.into_iter().map(|m| (m, 1.0)));
        }

        let deduped: Vec<(Memory, f64)> = raw
            .into_iter()
            .unique_by(|(m, _)| m.id.clone())
            .collect();
        let ranked = self.reranker.rerank(deduped, target);
        self.cache.set(&key, ranked.clone());
        Ok(ranked)
    }
}

static OPTIMIZER: Mutex<Option<Arc<SearchOptimizer>>> = Mutex::new(None);

/// Process-wide optimizer instance, constructed lazily from `config`.
pub fn get_optimizer(config: &MemoryConfig) -> Arc<SearchOptimizer> {
    let mut slot = OPTIMIZER.lock().expect("optimizer mutex poisoned");
    slot.get_or_insert_with(|| Arc::new(SearchOptimizer::new(config)))
        .clone()
}

/// Drop the process-wide optimizer so the next accessor call rebuilds it.
pub fn reset_optimizer() {
    let mut slot = OPTIMIZER.lock().expect("optimizer mutex poisoned");
    *slot = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryStatus, memory_id};
    use chrono::Duration as ChronoDuration;

    fn memory(ns: Namespace, idx: usize, spec: Option<&str>, tags: &[&str]) -> Memory {
        Memory {
            id: memory_id(ns, "abc", idx),
            commit_sha: "abc".to_string(),
            namespace: ns,
            timestamp: Some(Utc::now() - ChronoDuration::minutes(5)),
            summary: format!("memory {idx}"),
            content: String::new(),
            spec: spec.map(String::from),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            phase: None,
            status: MemoryStatus::Active,
            relates_to: Vec::new(),
        }
    }

    #[test]
    fn test_expander_lowercases_and_drops_short_tokens() {
        let expander = QueryExpander::new(5, false);
        let query = expander.expand("Fix DB a!", Vec::new());
        assert_eq!(query.original, "Fix DB a!");
        // "a" is dropped, "fix" and "db" expand.
        assert!(query.expanded_terms.contains(&"repair".to_string()));
        assert!(query.expanded_terms.contains(&"database".to_string()));
    }

    #[test]
    fn test_expander_caps_total_expansions() {
        let expander = QueryExpander::new(1, true);
        let query = expander.expand("database error deploy test config", Vec::new());
        assert!(query.expanded_terms.len() <= 2);
    }

    #[test]
    fn test_expander_never_repeats_query_tokens() {
        let expander = QueryExpander::new(5, false);
        let query = expander.expand("database db", Vec::new());
        assert!(!query.expanded_terms.contains(&"db".to_string()));
        assert!(!query.expanded_terms.contains(&"database".to_string()));
    }

    #[test]
    fn test_cache_key_is_deterministic_and_order_insensitive() {
        let a = SearchQuery {
            original: "db".to_string(),
            expanded_terms: vec!["database".to_string(), "storage".to_string()],
            filters: vec![
                ("spec".to_string(), "auth".to_string()),
                ("namespace".to_string(), "decisions".to_string()),
            ],
        };
        let b = SearchQuery {
            original: "db".to_string(),
            expanded_terms: vec!["storage".to_string(), "database".to_string()],
            filters: vec![
                ("namespace".to_string(), "decisions".to_string()),
                ("spec".to_string(), "auth".to_string()),
            ],
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 16);

        let c = SearchQuery {
            original: "other".to_string(),
            expanded_terms: Vec::new(),
            filters: Vec::new(),
        };
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_reranker_prefers_matching_spec_and_tags() {
        // Two close distances: the worse raw distance matches the target
        // spec and tags, the better one matches nothing.
        let matching = memory(Namespace::Decisions, 0, Some("auth"), &["database"]);
        let other = memory(Namespace::Decisions, 1, None, &[]);
        let target = RerankTarget {
            namespace: None,
            spec: Some("auth".to_string()),
            tags: vec!["database".to_string()],
        };
        let reranker = ResultReranker::new(RerankWeights::default(), 30.0);
        let ranked = reranker.rerank(vec![(other, 0.28), (matching, 0.30)], &target);
        assert_eq!(ranked[0].memory.id, "decisions:abc:0");
        assert!(ranked[0].rank_factors.spec == 1.0);
        assert!(ranked[0].rank_factors.tags == 1.0);
    }

    #[test]
    fn test_reranker_zero_weights_is_stable() {
        let weights = RerankWeights {
            recency: 0.0,
            namespace: 0.0,
            spec: 0.0,
            tags: 0.0,
        };
        let reranker = ResultReranker::new(weights, 30.0);
        let a = memory(Namespace::Decisions, 0, None, &[]);
        let b = memory(Namespace::Learnings, 1, None, &[]);
        let ranked = reranker.rerank(
            vec![(a, 0.1), (b, 0.2)],
            &RerankTarget::default(),
        );
        assert_eq!(ranked[0].original_score, 0.1);
        assert_eq!(ranked[0].boosted_score, 0.1);
        assert_eq!(ranked[1].boosted_score, 0.2);
    }

    #[test]
    fn test_recency_factor_bounds() {
        let reranker = ResultReranker::new(RerankWeights::default(), 30.0);
        let mut m = memory(Namespace::Progress, 0, None, &[]);

        m.timestamp = None;
        assert_eq!(reranker.recency_factor(&m), 0.0);

        m.timestamp = Some(Utc::now() + ChronoDuration::days(10));
        assert_eq!(reranker.recency_factor(&m), 1.0);

        m.timestamp = Some(Utc::now() - ChronoDuration::days(30));
        let half = reranker.recency_factor(&m);
        assert!((half - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_cache_set_get_round_trip() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        assert!(cache.get("missing").is_none());

        let results = vec![RankedResult {
            memory: memory(Namespace::Decisions, 0, None, &[]),
            original_score: 0.5,
            boosted_score: 0.2,
            rank_factors: RankFactors::default(),
        }];
        cache.set("key1", results.clone());
        let fetched = cache.get("key1").unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].memory.id, results[0].memory.id);

        // Empty lists are cacheable.
        cache.set("empty", Vec::new());
        assert_eq!(cache.get("empty").unwrap().len(), 0);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = SearchCache::new(10, Duration::from_millis(10));
        cache.set("key", Vec::new());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("key").is_none());
        // The expired entry was purged on access.
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = SearchCache::new(2, Duration::from_secs(60));
        cache.set("a", Vec::new());
        cache.set("b", Vec::new());
        // Touch "a" so "b" becomes least recently used.
        cache.get("a");
        cache.set("c", Vec::new());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_cache_invalidate_by_substring_and_all() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        cache.set("auth-search", Vec::new());
        cache.set("auth-recent", Vec::new());
        cache.set("billing", Vec::new());

        assert_eq!(cache.invalidate(Some("auth")), 2);
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.invalidate(None), 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    #[serial_test::serial]
    fn test_optimizer_singleton_reset() {
        reset_optimizer();
        let config = MemoryConfig::default();
        let first = get_optimizer(&config);
        let second = get_optimizer(&config);
        assert!(Arc::ptr_eq(&first, &second));
        reset_optimizer();
        let third = get_optimizer(&config);
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
