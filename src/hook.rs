use std::io::Read;

use serde_json::{Value, json};

use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::index::IndexService;
use crate::model::SyncOutcome;
use crate::store::NotesStore;
use crate::sync::SyncService;

/// Read the hook payload from `reader`. Session-end hooks may provide an
/// empty or malformed body; both collapse to an empty object.
pub fn parse_hook_input<R: Read>(mut reader: R) -> Value {
    let mut buffer = String::new();
    if reader.read_to_string(&mut buffer).is_err() {
        return json!({});
    }
    serde_json::from_str(&buffer).unwrap_or_else(|_| json!({}))
}

/// Shape the hook response for a sync outcome. The session always
/// continues; a productive sync adds a message, a failure a warning.
pub fn hook_output(outcome: &SyncOutcome) -> Value {
    match outcome {
        SyncOutcome::Completed(stats) if stats.added > 0 || stats.updated > 0 => json!({
            "continue": true,
            "message": format!(
                "Memory index synced: +{} new, ~{} updated",
                stats.added, stats.updated
            ),
        }),
        SyncOutcome::Completed(_) | SyncOutcome::InProgress => json!({ "continue": true }),
        SyncOutcome::Failed { error, .. } => json!({
            "continue": true,
            "warning": format!("Memory sync failed: {error}"),
        }),
    }
}

/// Run the session-end hook: a lightweight incremental sync so memories
/// captured during the session are queryable next time. Never blocks the
/// session from ending; any setup failure degrades to a warning.
pub fn session_end(config: &MemoryConfig, embedder: &dyn Embedder) -> Value {
    let result = (|| {
        let store = NotesStore::open(config)?;
        let index = IndexService::open(config)?;
        let sync = SyncService::new(&store, &index, embedder, config);
        sync.incremental_sync()
    })();
    match result {
        Ok(outcome) => hook_output(&outcome),
        Err(error) => json!({
            "continue": true,
            "warning": format!("Memory sync failed: {error}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::model::SyncStats;

    #[test]
    fn test_parse_hook_input_tolerates_garbage() {
        assert_eq!(parse_hook_input("".as_bytes()), json!({}));
        assert_eq!(parse_hook_input("not json".as_bytes()), json!({}));
        assert_eq!(
            parse_hook_input(r#"{"session_id": "s1"}"#.as_bytes()),
            json!({"session_id": "s1"})
        );
    }

    #[test]
    fn test_hook_output_quiet_when_nothing_changed() {
        let outcome = SyncOutcome::Completed(SyncStats::default());
        assert_eq!(hook_output(&outcome), json!({"continue": true}));
        assert_eq!(hook_output(&SyncOutcome::InProgress), json!({"continue": true}));
    }

    #[test]
    fn test_hook_output_reports_synced_counts() {
        let outcome = SyncOutcome::Completed(SyncStats {
            scanned: 3,
            added: 2,
            updated: 1,
            deleted: 0,
            errors: 0,
        });
        let output = hook_output(&outcome);
        assert_eq!(output["continue"], json!(true));
        assert_eq!(
            output["message"],
            json!("Memory index synced: +2 new, ~1 updated")
        );
    }

    #[test]
    fn test_hook_output_warns_on_failure() {
        let outcome = SyncOutcome::Failed {
            stats: SyncStats::default(),
            error: MemoryError::storage("ref is broken"),
        };
        let output = hook_output(&outcome);
        assert_eq!(output["continue"], json!(true));
        assert!(
            output["warning"]
                .as_str()
                .unwrap()
                .contains("Memory sync failed")
        );
    }

    #[test]
    fn test_session_end_degrades_to_warning_outside_a_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = MemoryConfig {
            repo_path: dir.path().to_path_buf(),
            index_path: dir.path().join("index.db"),
            embedding_dimension: 8,
            ..MemoryConfig::default()
        };
        let embedder = crate::embedding::HashingEmbedder::new(8);
        let output = session_end(&config, &embedder);
        assert_eq!(output["continue"], json!(true));
        assert!(output["warning"].is_string());
    }
}
