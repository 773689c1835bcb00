use std::env;
use std::path::PathBuf;

/// Immutable configuration for the memory store. Built once at startup and
/// passed by reference into each service.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Path to the git repository holding commits and notes.
    pub repo_path: PathBuf,
    /// Namespaced ref the notes live under.
    pub notes_ref: String,
    /// Path to the single-file SQLite index.
    pub index_path: PathBuf,
    /// Fixed embedding dimension, set at index initialization.
    pub embedding_dimension: usize,
    /// Half life in days for temporal decay.
    pub half_life_days: f64,
    /// Floor for the relevance decay curve.
    pub min_decay: f64,
    /// Age in days after which an active memory is eligible for archival.
    pub archive_age_days: f64,
    /// Age in days after which archived/resolved memories tombstone.
    pub tombstone_age_days: f64,
    /// Age in days after which tombstones are garbage collected.
    pub gc_age_days: f64,
    /// Relevance below which an old active memory archives.
    pub min_relevance_for_active: f64,
    /// zlib compression level (1-9) for archived content.
    pub compression_level: u32,
    /// Bounded wait acquiring the notes write lock.
    pub lock_timeout_seconds: u64,
    /// Search cache capacity.
    pub cache_max_size: usize,
    /// Search cache entry time-to-live.
    pub cache_ttl_seconds: u64,
    /// Maximum memory content size in bytes.
    pub max_content_bytes: usize,
    /// Maximum summary length in characters.
    pub max_summary_chars: usize,
    /// Token estimate per character for context sizing.
    pub tokens_per_char: f64,
    /// Maximum synonym expansions per query.
    pub max_expansions: usize,
    /// Jaccard overlap threshold for merging pattern clusters.
    pub cluster_overlap_threshold: f64,
    /// Confidence at which a candidate pattern auto-validates.
    pub min_confidence_for_validation: f64,
    /// Evidence count treated as full support in pattern confidence.
    pub promotion_occurrences: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            notes_ref: String::from("refs/notes/memory"),
            index_path: PathBuf::from(".mnemo/index.db"),
            embedding_dimension: 384,
            half_life_days: 30.0,
            min_decay: 0.0,
            archive_age_days: 90.0,
            tombstone_age_days: 180.0,
            gc_age_days: 365.0,
            min_relevance_for_active: 0.1,
            compression_level: 6,
            lock_timeout_seconds: 5,
            cache_max_size: 100,
            cache_ttl_seconds: 300,
            max_content_bytes: 65536,
            max_summary_chars: 200,
            tokens_per_char: 0.25,
            max_expansions: 5,
            cluster_overlap_threshold: 0.3,
            min_confidence_for_validation: 0.7,
            promotion_occurrences: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl MemoryConfig {
    /// Build the config from defaults overridden by `MNEMO_*` environment
    /// variables. Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            repo_path: env::var("MNEMO_REPO_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.repo_path),
            notes_ref: env::var("MNEMO_NOTES_REF").unwrap_or(defaults.notes_ref),
            index_path: env::var("MNEMO_INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_path),
            embedding_dimension: env_parse("MNEMO_EMBEDDING_DIMENSION", defaults.embedding_dimension),
            half_life_days: env_parse("MNEMO_HALF_LIFE_DAYS", defaults.half_life_days),
            min_decay: env_parse("MNEMO_MIN_DECAY", defaults.min_decay),
            archive_age_days: env_parse("MNEMO_ARCHIVE_AGE_DAYS", defaults.archive_age_days),
            tombstone_age_days: env_parse("MNEMO_TOMBSTONE_AGE_DAYS", defaults.tombstone_age_days),
            gc_age_days: env_parse("MNEMO_GC_AGE_DAYS", defaults.gc_age_days),
            min_relevance_for_active: env_parse(
                "MNEMO_MIN_RELEVANCE_FOR_ACTIVE",
                defaults.min_relevance_for_active,
            ),
            compression_level: env_parse("MNEMO_COMPRESSION_LEVEL", defaults.compression_level)
                .clamp(1, 9),
            lock_timeout_seconds: env_parse(
                "MNEMO_LOCK_TIMEOUT_SECONDS",
                defaults.lock_timeout_seconds,
            ),
            cache_max_size: env_parse("MNEMO_CACHE_MAX_SIZE", defaults.cache_max_size),
            cache_ttl_seconds: env_parse("MNEMO_CACHE_TTL_SECONDS", defaults.cache_ttl_seconds),
            max_content_bytes: env_parse("MNEMO_MAX_CONTENT_BYTES", defaults.max_content_bytes),
            max_summary_chars: env_parse("MNEMO_MAX_SUMMARY_CHARS", defaults.max_summary_chars),
            tokens_per_char: env_parse("MNEMO_TOKENS_PER_CHAR", defaults.tokens_per_char),
            max_expansions: env_parse("MNEMO_MAX_EXPANSIONS", defaults.max_expansions),
            cluster_overlap_threshold: env_parse(
                "MNEMO_CLUSTER_OVERLAP_THRESHOLD",
                defaults.cluster_overlap_threshold,
            ),
            min_confidence_for_validation: env_parse(
                "MNEMO_MIN_CONFIDENCE_FOR_VALIDATION",
                defaults.min_confidence_for_validation,
            ),
            promotion_occurrences: env_parse(
                "MNEMO_PROMOTION_OCCURRENCES",
                defaults.promotion_occurrences,
            ),
        }
    }
}
