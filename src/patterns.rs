use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::MemoryConfig;
use crate::model::{Memory, Namespace, Pattern, PatternStatus, PatternType};

/// Words carrying no signal for term extraction.
pub const STOP_WORDS: [&str; 60] = [
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "are", "was", "were", "be", "been", "being", "it", "its", "this", "that",
    "these", "those", "we", "you", "they", "have", "has", "had", "do", "does", "did", "will",
    "would", "can", "could", "should", "not", "no", "so", "if", "then", "than", "when", "what",
    "which", "who", "how", "all", "into", "about", "there", "here", "also",
];

/// Keyword evidence for each pattern type.
fn pattern_type_keywords() -> Vec<(PatternType, &'static [&'static str])> {
    vec![
        (
            PatternType::Success,
            &["success", "solved", "worked", "improved", "fixed", "achieved"][..],
        ),
        (
            PatternType::AntiPattern,
            &["error", "failed", "avoid", "bug", "broken", "regression"][..],
        ),
        (
            PatternType::Workflow,
            &["process", "workflow", "step", "sequence", "pipeline", "checklist"][..],
        ),
        (
            PatternType::Decision,
            &["decision", "chose", "choice", "tradeoff", "selected", "adopted"][..],
        ),
    ]
}

/// Namespaces that bias classification toward a type.
fn namespace_hints() -> HashMap<Namespace, PatternType> {
    HashMap::from([
        (Namespace::Blockers, PatternType::AntiPattern),
        (Namespace::Decisions, PatternType::Decision),
        (Namespace::Learnings, PatternType::Success),
        (Namespace::Progress, PatternType::Workflow),
    ])
}

/// Lowercased content-bearing terms from a memory's summary, body and
/// tags.
pub fn extract_terms(memory: &Memory) -> Vec<String> {
    let text = format!(
        "{} {} {}",
        memory.summary,
        memory.content,
        memory.tags.join(" ")
    );
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2 && !STOP_WORDS.contains(t))
        .map(String::from)
        .collect()
}

struct Cluster {
    terms: Vec<String>,
    evidence: BTreeSet<String>,
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Detects recurring observations in a memory corpus and manages their
/// candidate -> validated -> promoted -> deprecated lifecycle. Registered
/// patterns live in-process.
pub struct PatternManager {
    config: MemoryConfig,
    registry: Mutex<BTreeMap<String, Pattern>>,
}

impl PatternManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    fn relevance(&self, memory: &Memory) -> f64 {
        match memory.timestamp {
            Some(ts) => {
                let age_days = (Utc::now() - ts).num_seconds().max(0) as f64 / 86_400.0;
                (2f64)
                    .powf(-age_days / self.config.half_life_days)
                    .clamp(self.config.min_decay, 1.0)
            }
            None => 0.5,
        }
    }

    fn classify(&self, terms: &[String], memories: &[&Memory]) -> PatternType {
        let hints = namespace_hints();
        let mut best = PatternType::Technical;
        let mut best_score = 0usize;
        for (pattern_type, keywords) in pattern_type_keywords() {
            let keyword_hits = terms
                .iter()
                .filter(|t| keywords.contains(&t.as_str()))
                .count();
            let namespace_hits = memories
                .iter()
                .filter(|m| hints.get(&m.namespace) == Some(&pattern_type))
                .count();
            let score = keyword_hits * 2 + namespace_hits;
            // Strict comparison keeps the tie-break on TECHNICAL.
            if score > best_score {
                best_score = score;
                best = pattern_type;
            }
        }
        best
    }

    fn title_case(term: &str) -> String {
        let mut chars = term.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Mine candidate patterns from a corpus. Terms appearing in at least
    /// `min_occurrences` memories seed greedy clusters, merged on memory
    /// set overlap; clusters are scored by coverage and term rarity, then
    /// the top `max_candidates` become candidate patterns.
    pub fn detect_patterns(
        &self,
        memories: &[Memory],
        min_occurrences: usize,
        max_candidates: usize,
    ) -> Vec<Pattern> {
        let total = memories.len();
        if total == 0 || min_occurrences == 0 {
            return Vec::new();
        }
        let by_id: HashMap<&str, &Memory> =
            memories.iter().map(|m| (m.id.as_str(), m)).collect();

        // Postings: term -> set of memory ids containing it.
        let mut postings: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for memory in memories {
            for term in extract_terms(memory) {
                postings.entry(term).or_default().insert(memory.id.clone());
            }
        }

        // Candidate terms in descending occurrence order, alphabetical on
        // ties so detection is deterministic.
        let mut candidates: Vec<(&String, &BTreeSet<String>)> = postings
            .iter()
            .filter(|(_, ids)| ids.len() >= min_occurrences)
            .collect();
        candidates.sort_by(|(term_a, ids_a), (term_b, ids_b)| {
            ids_b.len().cmp(&ids_a.len()).then_with(|| term_a.cmp(term_b))
        });

        // Greedy cluster formation.
        let mut assigned: BTreeSet<&str> = BTreeSet::new();
        let mut clusters: Vec<Cluster> = Vec::new();
        for &(seed_term, seed_ids) in &candidates {
            if assigned.contains(seed_term.as_str()) {
                continue;
            }
            assigned.insert(seed_term.as_str());
            let mut cluster = Cluster {
                terms: vec![seed_term.clone()],
                evidence: seed_ids.clone(),
            };
            for &(term, ids) in &candidates {
                if assigned.contains(term.as_str()) {
                    continue;
                }
                if jaccard(ids, &cluster.evidence) >= self.config.cluster_overlap_threshold {
                    assigned.insert(term.as_str());
                    cluster.terms.push(term.clone());
                    cluster.evidence.extend(ids.iter().cloned());
                }
            }
            clusters.push(cluster);
        }

        // Score: coverage times summed term rarity, boosted by recency.
        let mut scored: Vec<(Cluster, f64, f64)> = clusters
            .into_iter()
            .map(|cluster| {
                let idf_sum: f64 = cluster
                    .terms
                    .iter()
                    .map(|t| {
                        let df = postings.get(t).map(|ids| ids.len()).unwrap_or(1);
                        (1.0 + total as f64 / df as f64).ln()
                    })
                    .sum();
                let raw = cluster.evidence.len() as f64 / total as f64 * idf_sum;
                let members: Vec<&Memory> = cluster
                    .evidence
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).copied())
                    .collect();
                let recency = if members.is_empty() {
                    0.0
                } else {
                    members.iter().map(|m| self.relevance(m)).sum::<f64>()
                        / members.len() as f64
                };
                (cluster, raw, recency)
            })
            .collect();

        let max_raw = scored
            .iter()
            .map(|(_, raw, _)| *raw)
            .fold(0.0f64, f64::max);
        scored.sort_by(|(_, raw_a, _), (_, raw_b, _)| {
            raw_b.partial_cmp(raw_a).unwrap_or(std::cmp::Ordering::Equal)
        });

        let now = Utc::now();
        scored
            .into_iter()
            .take(max_candidates)
            .map(|(cluster, raw, recency)| {
                let normalized = if max_raw > 0.0 { raw / max_raw } else { 0.0 };
                let members: Vec<&Memory> = cluster
                    .evidence
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).copied())
                    .collect();
                let pattern_type = self.classify(&cluster.terms, &members);
                let top_terms: Vec<String> = cluster
                    .terms
                    .iter()
                    .take(3)
                    .map(|t| Self::title_case(t))
                    .collect();
                let name = format!("{} ({})", top_terms.join(" "), pattern_type.label());
                let evidence: Vec<String> = cluster.evidence.iter().cloned().collect();
                let support = (evidence.len() as f64
                    / self.config.promotion_occurrences as f64)
                    .min(1.0);
                let occurrence_count = evidence.len();
                Pattern {
                    name,
                    pattern_type,
                    description: format!(
                        "Recurring theme across {} memories around: {}",
                        occurrence_count,
                        cluster.terms.join(", ")
                    ),
                    tags: cluster.terms.clone(),
                    evidence,
                    confidence: (normalized * 0.6 + recency * 0.2 + support * 0.2)
                        .clamp(0.0, 1.0),
                    status: PatternStatus::Candidate,
                    first_seen: now,
                    last_seen: now,
                    occurrence_count,
                }
            })
            .collect()
    }

    /// Register (or replace) a pattern under its case-insensitive name.
    pub fn register_pattern(&self, pattern: Pattern) {
        let mut registry = self.registry.lock().expect("pattern registry poisoned");
        registry.insert(pattern.name.to_lowercase(), pattern);
    }

    pub fn get_pattern(&self, name: &str) -> Option<Pattern> {
        let registry = self.registry.lock().expect("pattern registry poisoned");
        registry.get(&name.to_lowercase()).cloned()
    }

    /// candidate -> validated. Any other starting status is "not
    /// performed".
    pub fn validate_pattern(&self, name: &str) -> bool {
        self.transition(name, PatternStatus::Candidate, PatternStatus::Validated)
    }

    /// validated -> promoted.
    pub fn promote_pattern(&self, name: &str) -> bool {
        self.transition(name, PatternStatus::Validated, PatternStatus::Promoted)
    }

    /// Any status except deprecated -> deprecated.
    pub fn deprecate_pattern(&self, name: &str) -> bool {
        let mut registry = self.registry.lock().expect("pattern registry poisoned");
        match registry.get_mut(&name.to_lowercase()) {
            Some(pattern) if pattern.status != PatternStatus::Deprecated => {
                pattern.status = PatternStatus::Deprecated;
                true
            }
            _ => false,
        }
    }

    fn transition(&self, name: &str, from: PatternStatus, to: PatternStatus) -> bool {
        let mut registry = self.registry.lock().expect("pattern registry poisoned");
        match registry.get_mut(&name.to_lowercase()) {
            Some(pattern) if pattern.status == from => {
                pattern.status = to;
                true
            }
            _ => false,
        }
    }

    /// Attach a memory as evidence. A duplicate id is a no-op. The
    /// evidence-support share of confidence is recomputed, and a candidate
    /// crossing the validation threshold auto-validates.
    pub fn add_evidence(&self, name: &str, memory_id: &str) -> bool {
        let mut registry = self.registry.lock().expect("pattern registry poisoned");
        let Some(pattern) = registry.get_mut(&name.to_lowercase()) else {
            return false;
        };
        if pattern.evidence.iter().any(|id| id == memory_id) {
            return false;
        }
        let threshold = self.config.promotion_occurrences as f64;
        let old_support = (pattern.occurrence_count as f64 / threshold).min(1.0);
        pattern.evidence.push(memory_id.to_string());
        pattern.occurrence_count = pattern.evidence.len();
        let new_support = (pattern.occurrence_count as f64 / threshold).min(1.0);
        pattern.confidence =
            (pattern.confidence + 0.2 * (new_support - old_support)).clamp(0.0, 1.0);
        pattern.last_seen = Utc::now();

        if pattern.status == PatternStatus::Candidate
            && pattern.confidence >= self.config.min_confidence_for_validation
        {
            pattern.status = PatternStatus::Validated;
        }
        true
    }

    /// Patterns whose tag set overlaps the memory's terms by at least
    /// `min_term_overlap`. Deprecated patterns never match.
    pub fn find_matching_patterns(
        &self,
        memory: &Memory,
        min_term_overlap: f64,
    ) -> Vec<(Pattern, f64)> {
        let terms: BTreeSet<String> = extract_terms(memory).into_iter().collect();
        let registry = self.registry.lock().expect("pattern registry poisoned");
        let mut matches: Vec<(Pattern, f64)> = registry
            .values()
            .filter(|p| p.status != PatternStatus::Deprecated && !p.tags.is_empty())
            .filter_map(|p| {
                let hits = p.tags.iter().filter(|t| terms.contains(*t)).count();
                let score = hits as f64 / p.tags.len() as f64;
                (score >= min_term_overlap).then(|| (p.clone(), score))
            })
            .collect();
        matches.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    /// Registered patterns, optionally filtered, sorted by confidence
    /// descending with name order breaking ties.
    pub fn list_patterns(
        &self,
        status: Option<PatternStatus>,
        pattern_type: Option<PatternType>,
    ) -> Vec<Pattern> {
        let registry = self.registry.lock().expect("pattern registry poisoned");
        let mut patterns: Vec<Pattern> = registry
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .filter(|p| pattern_type.is_none_or(|t| p.pattern_type == t))
            .cloned()
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns
    }
}

static MANAGER: Mutex<Option<Arc<PatternManager>>> = Mutex::new(None);

/// Process-wide pattern manager holding the in-process registry.
pub fn get_default_manager(config: &MemoryConfig) -> Arc<PatternManager> {
    let mut slot = MANAGER.lock().expect("pattern manager mutex poisoned");
    slot.get_or_insert_with(|| Arc::new(PatternManager::new(config.clone())))
        .clone()
}

pub fn reset_default_manager() {
    let mut slot = MANAGER.lock().expect("pattern manager mutex poisoned");
    *slot = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryStatus, memory_id};
    use chrono::Utc;

    fn manager() -> PatternManager {
        PatternManager::new(MemoryConfig::default())
    }

    fn memory(ns: Namespace, idx: usize, summary: &str, tags: &[&str]) -> Memory {
        Memory {
            id: memory_id(ns, "abc", idx),
            commit_sha: "abc".to_string(),
            namespace: ns,
            timestamp: Some(Utc::now()),
            summary: summary.to_string(),
            content: String::new(),
            spec: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            phase: None,
            status: MemoryStatus::Active,
            relates_to: Vec::new(),
        }
    }

    fn candidate(name: &str, confidence: f64, tags: &[&str]) -> Pattern {
        Pattern {
            name: name.to_string(),
            pattern_type: PatternType::Technical,
            description: String::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            evidence: vec!["learnings:abc:0".to_string()],
            confidence,
            status: PatternStatus::Candidate,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            occurrence_count: 1,
        }
    }

    #[test]
    fn test_extract_terms_drops_stop_words_and_short_tokens() {
        let m = memory(
            Namespace::Learnings,
            0,
            "The migration of a database to X",
            &["infra"],
        );
        let terms = extract_terms(&m);
        assert!(terms.contains(&"migration".to_string()));
        assert!(terms.contains(&"database".to_string()));
        assert!(terms.contains(&"infra".to_string()));
        assert!(!terms.contains(&"the".to_string()));
        assert!(!terms.contains(&"of".to_string()));
        assert!(!terms.contains(&"x".to_string()));
    }

    #[test]
    fn test_detect_patterns_clusters_shared_tag() {
        let mgr = manager();
        let memories = vec![
            memory(Namespace::Learnings, 0, "tuned database pool", &["database"]),
            memory(Namespace::Learnings, 1, "database index added", &["database"]),
            memory(Namespace::Learnings, 2, "database backup set up", &["database"]),
        ];
        let patterns = mgr.detect_patterns(&memories, 2, 10);
        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert!(pattern.tags.contains(&"database".to_string()));
        assert_eq!(pattern.status, PatternStatus::Candidate);
        assert_eq!(pattern.occurrence_count, 3);
        assert_eq!(pattern.evidence.len(), 3);
        assert!(pattern.confidence > 0.0 && pattern.confidence <= 1.0);
        assert!(pattern.last_seen >= pattern.first_seen);
    }

    #[test]
    fn test_detect_patterns_honors_min_occurrences() {
        let mgr = manager();
        let memories = vec![
            memory(Namespace::Learnings, 0, "singleton topic", &[]),
            memory(Namespace::Learnings, 1, "another subject", &[]),
        ];
        assert!(mgr.detect_patterns(&memories, 2, 10).is_empty());
        assert!(mgr.detect_patterns(&[], 2, 10).is_empty());
    }

    #[test]
    fn test_detect_patterns_caps_candidates() {
        let mgr = manager();
        let mut memories = Vec::new();
        // Two disjoint clusters: "database" and "frontend".
        for i in 0..2 {
            memories.push(memory(Namespace::Learnings, i, "database pool", &["database"]));
        }
        for i in 2..4 {
            memories.push(memory(Namespace::Progress, i, "frontend layout", &["frontend"]));
        }
        let all = mgr.detect_patterns(&memories, 2, 10);
        assert!(all.len() >= 2);
        let capped = mgr.detect_patterns(&memories, 2, 1);
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_classification_from_keywords_and_namespaces() {
        let mgr = manager();
        let blockers = vec![
            memory(Namespace::Blockers, 0, "build failed with linker error", &["ci"]),
            memory(Namespace::Blockers, 1, "tests failed again error", &["ci"]),
        ];
        let patterns = mgr.detect_patterns(&blockers, 2, 10);
        assert!(!patterns.is_empty());
        assert_eq!(patterns[0].pattern_type, PatternType::AntiPattern);

        let neutral = vec![
            memory(Namespace::Inception, 0, "widget gadget assembly", &["widget"]),
            memory(Namespace::Inception, 1, "widget gadget alignment", &["widget"]),
        ];
        let patterns = mgr.detect_patterns(&neutral, 2, 10);
        assert_eq!(patterns[0].pattern_type, PatternType::Technical);
    }

    #[test]
    fn test_pattern_name_shape() {
        let mgr = manager();
        let memories = vec![
            memory(Namespace::Decisions, 0, "chose postgres storage", &["database"]),
            memory(Namespace::Decisions, 1, "chose postgres replication", &["database"]),
        ];
        let patterns = mgr.detect_patterns(&memories, 2, 10);
        let name = &patterns[0].name;
        assert!(name.ends_with("(Decision)"), "unexpected name {name}");
        // Title-cased top terms precede the type label.
        assert!(name.chars().next().unwrap().is_uppercase());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mgr = manager();
        mgr.register_pattern(candidate("Retry Loops", 0.5, &["retry"]));

        // candidate -> promoted is not a permitted edge.
        assert!(!mgr.promote_pattern("Retry Loops"));
        assert!(mgr.validate_pattern("Retry Loops"));
        // Already validated; validate again is "not performed".
        assert!(!mgr.validate_pattern("Retry Loops"));
        assert!(mgr.promote_pattern("Retry Loops"));
        assert!(mgr.deprecate_pattern("Retry Loops"));
        // Deprecated stays deprecated.
        assert!(!mgr.deprecate_pattern("Retry Loops"));
        assert!(!mgr.validate_pattern("Retry Loops"));

        assert!(!mgr.validate_pattern("unknown pattern"));
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let mgr = manager();
        mgr.register_pattern(candidate("Cache Stampede", 0.4, &["cache"]));
        assert!(mgr.get_pattern("cache stampede").is_some());
        assert!(mgr.validate_pattern("CACHE STAMPEDE"));
    }

    #[test]
    fn test_add_evidence_bumps_and_auto_validates() {
        let mgr = manager();
        mgr.register_pattern(candidate("Flaky Tests", 0.69, &["flaky"]));

        assert!(mgr.add_evidence("Flaky Tests", "blockers:abc:1"));
        let pattern = mgr.get_pattern("Flaky Tests").unwrap();
        assert_eq!(pattern.occurrence_count, 2);
        assert_eq!(pattern.evidence.len(), 2);
        // 0.69 + 0.2 * (2/5 - 1/5) crosses the 0.7 validation line.
        assert!(pattern.confidence >= 0.7);
        assert_eq!(pattern.status, PatternStatus::Validated);

        // Duplicate evidence is a no-op.
        assert!(!mgr.add_evidence("Flaky Tests", "blockers:abc:1"));
        assert_eq!(mgr.get_pattern("Flaky Tests").unwrap().occurrence_count, 2);
    }

    #[test]
    fn test_find_matching_excludes_deprecated() {
        let mgr = manager();
        mgr.register_pattern(candidate("Database Tuning", 0.5, &["database", "tuning"]));
        mgr.register_pattern(candidate("Old Ways", 0.5, &["database"]));
        mgr.deprecate_pattern("Old Ways");

        let probe = memory(Namespace::Learnings, 9, "database tuning session", &[]);
        let matches = mgr.find_matching_patterns(&probe, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0.name, "Database Tuning");
        assert!((matches[0].1 - 1.0).abs() < 1e-9);

        // Threshold excludes weak overlaps.
        let weak = memory(Namespace::Learnings, 10, "tuning only", &[]);
        assert!(mgr.find_matching_patterns(&weak, 0.6).is_empty());
    }

    #[test]
    fn test_list_patterns_sorted_and_filtered() {
        let mgr = manager();
        mgr.register_pattern(candidate("Low", 0.2, &["a"]));
        mgr.register_pattern(candidate("High", 0.9, &["b"]));
        mgr.register_pattern(candidate("Mid", 0.5, &["c"]));
        mgr.validate_pattern("Mid");

        let all = mgr.list_patterns(None, None);
        let names: Vec<&str> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["High", "Mid", "Low"]);

        let candidates = mgr.list_patterns(Some(PatternStatus::Candidate), None);
        assert_eq!(candidates.len(), 2);

        let technical = mgr.list_patterns(None, Some(PatternType::Technical));
        assert_eq!(technical.len(), 3);
    }

    #[test]
    #[serial_test::serial]
    fn test_default_manager_singleton_resets() {
        reset_default_manager();
        let config = MemoryConfig::default();
        let a = get_default_manager(&config);
        let b = get_default_manager(&config);
        assert!(Arc::ptr_eq(&a, &b));
        reset_default_manager();
        assert!(!Arc::ptr_eq(&a, &get_default_manager(&config)));
    }
}
