use std::fmt;

/// Closed set of error categories surfaced to callers. Every failure in
/// the crate maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Storage,
    Index,
    Embedding,
    Parse,
    Capture,
    Recall,
    Validation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Storage => "storage",
            ErrorCategory::Index => "index",
            ErrorCategory::Embedding => "embedding",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Capture => "capture",
            ErrorCategory::Recall => "recall",
            ErrorCategory::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// Error type for all memory store operations. Carries the category, a
/// human readable message, and a recovery hint telling the operator what
/// to do about it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{category} error: {message}")]
pub struct MemoryError {
    pub category: ErrorCategory,
    pub message: String,
    pub recovery: Option<String>,
}

pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            recovery: None,
        }
    }

    pub fn with_recovery(mut self, hint: impl Into<String>) -> Self {
        self.recovery = Some(hint.into());
        self
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Storage, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Index, message)
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Embedding, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Parse, message)
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Capture, message)
    }

    pub fn recall(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Recall, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }
}

// Pre-defined instances for the operator-facing failures. Constructors
// rather than statics so messages can carry the offending value.

pub fn no_commits_error() -> MemoryError {
    MemoryError::storage("repository has no commits to attach memories to")
        .with_recovery("create at least one commit before capturing a memory")
}

pub fn permission_denied_error(detail: &str) -> MemoryError {
    MemoryError::storage(format!("permission denied writing notes: {detail}"))
        .with_recovery("check repository ownership and file permissions")
}

pub fn index_locked_error() -> MemoryError {
    MemoryError::index("index is locked by another writer")
        .with_recovery("retry after the other process finishes, or remove a stale lock file")
}

pub fn vec_extension_missing_error(detail: &str) -> MemoryError {
    MemoryError::index(format!("sqlite-vec extension unavailable: {detail}"))
        .with_recovery("rebuild with the bundled sqlite-vec extension enabled")
}

pub fn schema_version_error(found: i64, expected: i64) -> MemoryError {
    MemoryError::index(format!(
        "index schema version {found} does not match expected {expected}"
    ))
    .with_recovery("delete the index file and rebuild from notes with `sync --rebuild`")
}

pub fn model_oom_error(detail: &str) -> MemoryError {
    MemoryError::embedding(format!("out of memory loading embedding model: {detail}"))
        .with_recovery("free memory or use a smaller embedding model")
}

pub fn model_corrupted_error(detail: &str) -> MemoryError {
    MemoryError::embedding(format!("embedding model file corrupted: {detail}"))
        .with_recovery("delete the cached model files so they are re-downloaded")
}

pub fn dimension_mismatch_error(got: usize, expected: usize) -> MemoryError {
    MemoryError::index(format!(
        "embedding has dimension {got} but the index was initialized with {expected}"
    ))
    .with_recovery("rebuild the index if the embedding model changed")
}

pub fn invalid_yaml_error(detail: &str) -> MemoryError {
    MemoryError::parse(format!("invalid YAML front matter: {detail}"))
        .with_recovery("fix the note front matter so it parses as a YAML mapping")
}

pub fn missing_fields_error(fields: &[&str]) -> MemoryError {
    MemoryError::parse(format!(
        "missing required front matter field(s): {}",
        fields.join(", ")
    ))
    .with_recovery("add the missing fields to the note front matter")
}

pub fn lock_timeout_error(seconds: u64) -> MemoryError {
    MemoryError::capture(format!(
        "timed out after {seconds}s waiting for the notes write lock"
    ))
    .with_recovery("retry, or remove the lock file if the holder crashed")
}

pub fn invalid_namespace_error(got: &str, valid: &[&str]) -> MemoryError {
    MemoryError::validation(format!(
        "invalid namespace {:?}, valid namespaces are: {}",
        got,
        valid.join(", ")
    ))
    .with_recovery("use one of the listed namespaces")
}

pub fn content_too_large_error(size: usize, max: usize) -> MemoryError {
    MemoryError::validation(format!(
        "content is {size} bytes which exceeds the {max} byte limit"
    ))
    .with_recovery("shorten the content or raise the configured byte limit")
}

pub fn summary_too_long_error(len: usize, max: usize) -> MemoryError {
    MemoryError::validation(format!(
        "summary is {len} characters which exceeds the {max} character limit"
    ))
    .with_recovery("shorten the summary")
}

pub fn deadline_exceeded_error(operation: &str) -> MemoryError {
    MemoryError::index(format!("{operation} exceeded its deadline"))
        .with_recovery("re-run the operation; progress up to the last checkpoint is preserved")
}

pub fn invalid_ref_error(name: &str) -> MemoryError {
    MemoryError::validation(format!("invalid or unsafe ref name {name:?}"))
        .with_recovery("use a plain refs/notes/<name> ref without traversal or metacharacters")
}

pub fn path_traversal_error(path: &str) -> MemoryError {
    MemoryError::validation(format!("path {path:?} contains traversal components"))
        .with_recovery("pass a path inside the repository without `..` components")
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::index(err.to_string())
    }
}

impl From<git2::Error> for MemoryError {
    fn from(err: git2::Error) -> Self {
        MemoryError::storage(err.to_string())
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            permission_denied_error(&err.to_string())
        } else {
            MemoryError::storage(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for MemoryError {
    fn from(err: serde_yaml::Error) -> Self {
        invalid_yaml_error(&err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_namespace_lists_valid_set() {
        let err = invalid_namespace_error("bogus", &["decisions", "learnings"]);
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("bogus"));
        assert!(err.message.contains("decisions, learnings"));
        assert!(err.recovery.is_some());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Index.to_string(), "index");
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
    }

    #[test]
    fn test_io_permission_denied_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "notes ref");
        let err: MemoryError = io.into();
        assert_eq!(err.category, ErrorCategory::Storage);
        assert!(err.message.contains("permission denied"));
    }
}
