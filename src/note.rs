use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_yaml::{Mapping, Value};

use crate::error::{MemoryError, Result, invalid_yaml_error, missing_fields_error};
use crate::model::{Memory, MemoryStatus, Namespace, memory_id};

/// Front matter keys every memory note must carry.
pub const REQUIRED_KEYS: [&str; 4] = ["type", "spec", "timestamp", "summary"];

const DELIMITER: &str = "---";

/// A note split into its YAML front matter and markdown body. The mapping
/// preserves key order so serialization round-trips.
#[derive(Debug, Clone)]
pub struct ParsedNote {
    pub front_matter: Mapping,
    pub body: String,
    pub raw: String,
}

impl ParsedNote {
    /// Names of required front matter keys that are absent.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| !self.front_matter.contains_key(*k))
            .collect()
    }

    /// Check the required keys, surfacing the full set of missing ones.
    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_keys();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing_fields_error(&missing))
        }
    }

    fn str_field(&self, key: &str) -> Option<String> {
        match self.front_matter.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    fn list_field(&self, key: &str) -> Vec<String> {
        match self.front_matter.get(key) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            // A scalar where a list belongs is tolerated as a single entry.
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Project the parsed note into a `Memory` attached to `commit_sha` at
    /// block position `index`.
    pub fn to_memory(&self, commit_sha: &str, index: usize) -> Result<Memory> {
        self.validate()?;
        let namespace: Namespace = self
            .str_field("type")
            .unwrap_or_default()
            .parse()?;
        let timestamp = self.str_field("timestamp").and_then(|t| parse_timestamp(&t));
        let status = self
            .str_field("status")
            .map(|s| MemoryStatus::parse_or_active(&s))
            .unwrap_or(MemoryStatus::Active);

        Ok(Memory {
            id: memory_id(namespace, commit_sha, index),
            commit_sha: commit_sha.to_string(),
            namespace,
            timestamp,
            summary: self.str_field("summary").unwrap_or_default(),
            content: self.body.clone(),
            spec: self.str_field("spec").filter(|s| !s.is_empty()),
            tags: self.list_field("tags"),
            phase: self.str_field("phase").filter(|s| !s.is_empty()),
            status,
            relates_to: self.list_field("relates_to"),
        })
    }
}

/// Normalize an ISO-8601 timestamp string to a timezone-aware UTC instant.
/// Accepts `Z`, explicit offsets, naive datetimes (treated as UTC), and
/// bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn parse_front_matter(text: &str) -> Result<Mapping> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| invalid_yaml_error(&e.to_string()))?;
    match value {
        Value::Mapping(map) => Ok(map),
        // An empty front matter block parses as null and is allowed.
        Value::Null => Ok(Mapping::new()),
        Value::Sequence(_) => Err(invalid_yaml_error("front matter must be a mapping, not a list")),
        _ => Err(invalid_yaml_error("front matter must be a mapping")),
    }
}

/// Parse a single note. The front matter must open with `---` on the first
/// line and close with a matching `---`; everything after the closing
/// delimiter is the body, which may itself contain `---` lines.
pub fn parse_note(raw: &str) -> Result<ParsedNote> {
    let mut lines = raw.lines();
    match lines.next() {
        Some(line) if line.trim_end() == DELIMITER => {}
        _ => {
            return Err(MemoryError::parse(
                "note does not start with a --- front matter delimiter",
            ));
        }
    }

    let mut front_lines: Vec<&str> = Vec::new();
    let mut closed = false;
    let mut body_lines: Vec<&str> = Vec::new();
    for line in lines {
        if !closed && line.trim_end() == DELIMITER {
            closed = true;
            continue;
        }
        if closed {
            body_lines.push(line);
        } else {
            front_lines.push(line);
        }
    }
    if !closed {
        return Err(MemoryError::parse("unterminated front matter, missing closing ---"));
    }

    let front_matter = parse_front_matter(&front_lines.join("\n"))?;
    let body = body_lines.join("\n").trim_end_matches('\n').to_string();
    Ok(ParsedNote {
        front_matter,
        body,
        raw: raw.to_string(),
    })
}

/// Parse a buffer that may concatenate multiple note blocks. Valid blocks
/// are recovered in order; malformed blocks are skipped by seeking to the
/// next `---` at line start and restarting the scan from there.
pub fn parse_notes(raw: &str) -> Vec<ParsedNote> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut notes = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].trim_end() != DELIMITER {
            i += 1;
            continue;
        }
        // Find the closing front matter delimiter.
        let Some(close) = (i + 1..lines.len()).find(|&j| lines[j].trim_end() == DELIMITER) else {
            break;
        };
        let front_text = lines[i + 1..close].join("\n");
        let front_matter = match parse_front_matter(&front_text) {
            // An empty mapping here usually means a stray delimiter pair
            // paired up with the next block's opener. Treat it as malformed
            // so the opener is still available to the restarted scan.
            Ok(map) if !map.is_empty() => map,
            _ => {
                // Malformed block: the closing delimiter may open the next
                // valid block, so restart the scan there.
                i = close;
                continue;
            }
        };

        // Body runs until the next block opener or the end of the buffer.
        let body_end = (close + 1..lines.len())
            .find(|&j| lines[j].trim_end() == DELIMITER)
            .unwrap_or(lines.len());
        let body = lines[close + 1..body_end]
            .join("\n")
            .trim_end_matches('\n')
            .to_string();
        let raw_block = lines[i..body_end].join("\n");

        notes.push(ParsedNote {
            front_matter,
            body,
            raw: raw_block,
        });
        i = body_end;
    }

    notes
}

/// Parse every valid block in a note blob into memories for `commit_sha`.
/// A memory's index is its position among the blocks that projected
/// cleanly; blocks missing required keys or naming an unknown namespace
/// are skipped.
pub fn memories_from_blob(raw: &str, commit_sha: &str) -> Vec<Memory> {
    parse_notes(raw)
        .iter()
        .filter_map(|note| note.to_memory(commit_sha, 0).ok())
        .enumerate()
        .map(|(index, mut memory)| {
            memory.id = memory_id(memory.namespace, commit_sha, index);
            memory
        })
        .collect()
}

/// Serialize front matter and body into canonical note text: delimiters,
/// the mapping in insertion order, and a single trailing newline after the
/// body.
pub fn serialize_note(front_matter: &Mapping, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(&Value::Mapping(front_matter.clone()))?;
    let body = body.trim_end_matches('\n');
    if body.is_empty() {
        Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n"))
    } else {
        Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{body}\n"))
    }
}

/// Build the canonical front matter mapping for a memory and serialize it.
pub fn serialize_memory(memory: &Memory) -> Result<String> {
    let mut map = Mapping::new();
    map.insert(
        Value::String("type".into()),
        Value::String(memory.namespace.as_str().into()),
    );
    map.insert(
        Value::String("spec".into()),
        Value::String(memory.spec.clone().unwrap_or_default()),
    );
    let ts = memory
        .timestamp
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default();
    map.insert(Value::String("timestamp".into()), Value::String(ts));
    map.insert(
        Value::String("summary".into()),
        Value::String(memory.summary.clone()),
    );
    if !memory.tags.is_empty() {
        map.insert(
            Value::String("tags".into()),
            Value::Sequence(memory.tags.iter().map(|t| Value::String(t.clone())).collect()),
        );
    }
    if let Some(phase) = &memory.phase {
        map.insert(Value::String("phase".into()), Value::String(phase.clone()));
    }
    if memory.status != MemoryStatus::Active {
        map.insert(
            Value::String("status".into()),
            Value::String(memory.status.as_str().into()),
        );
    }
    if !memory.relates_to.is_empty() {
        map.insert(
            Value::String("relates_to".into()),
            Value::Sequence(
                memory
                    .relates_to
                    .iter()
                    .map(|r| Value::String(r.clone()))
                    .collect(),
            ),
        );
    }
    serialize_note(&map, &memory.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const VALID_NOTE: &str = "---\ntype: decisions\nspec: auth\ntimestamp: 2024-06-01T12:00:00Z\nsummary: Use PostgreSQL\ntags: [database, infra]\n---\nWe compared PostgreSQL and MySQL.\n";

    #[test]
    fn test_parse_single_note() {
        let note = parse_note(VALID_NOTE).unwrap();
        assert_eq!(
            note.front_matter.get(Value::String("type".into())),
            Some(&Value::String("decisions".into()))
        );
        assert_eq!(note.body, "We compared PostgreSQL and MySQL.");
        assert!(note.missing_keys().is_empty());
    }

    #[test]
    fn test_missing_opening_delimiter_fails() {
        let err = parse_note("type: decisions\n---\nbody").unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Parse);
    }

    #[test]
    fn test_unterminated_front_matter_fails() {
        let err = parse_note("---\ntype: decisions\nno closing delimiter").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_list_at_root_rejected() {
        let err = parse_note("---\n- a\n- b\n---\nbody").unwrap_err();
        assert!(err.message.contains("mapping"));
    }

    #[test]
    fn test_empty_front_matter_allowed() {
        let note = parse_note("---\n---\nbody only").unwrap();
        assert!(note.front_matter.is_empty());
        assert_eq!(note.body, "body only");
    }

    #[test]
    fn test_body_may_contain_delimiter_in_single_mode() {
        let note = parse_note("---\ntype: progress\n---\nabove\n---\nbelow\n").unwrap();
        assert_eq!(note.body, "above\n---\nbelow");
    }

    #[test]
    fn test_validate_reports_all_missing_keys() {
        let note = parse_note("---\ntype: decisions\n---\nbody").unwrap();
        let missing = note.missing_keys();
        assert_eq!(missing, vec!["spec", "timestamp", "summary"]);
    }

    #[test]
    fn test_multi_note_recovers_valid_blocks() {
        let buffer = format!(
            "{}---\ntags: [unclosed\n---\n{}",
            VALID_NOTE,
            VALID_NOTE.replace("Use PostgreSQL", "Second note")
        );
        let notes = parse_notes(&buffer);
        // The malformed middle block is skipped silently.
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].str_field("summary").unwrap(), "Second note");
    }

    #[test]
    fn test_multi_note_empty_buffer() {
        assert!(parse_notes("").is_empty());
        assert!(parse_notes("no delimiters here").is_empty());
    }

    #[test]
    fn test_timestamp_normalization() {
        let utc = parse_timestamp("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());

        // Explicit offsets convert to UTC.
        let offset = parse_timestamp("2024-06-01T14:00:00+02:00").unwrap();
        assert_eq!(offset, utc);

        // Naive datetimes are treated as UTC.
        let naive = parse_timestamp("2024-06-01T12:00:00").unwrap();
        assert_eq!(naive, utc);

        // Bare dates are midnight UTC.
        let date = parse_timestamp("2024-06-01").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_serialize_round_trip() {
        let note = parse_note(VALID_NOTE).unwrap();
        let serialized = serialize_note(&note.front_matter, &note.body).unwrap();
        let reparsed = parse_note(&serialized).unwrap();
        assert_eq!(reparsed.front_matter, note.front_matter);
        assert_eq!(reparsed.body, note.body);
    }

    #[test]
    fn test_serialize_appends_trailing_newline() {
        let note = parse_note(VALID_NOTE).unwrap();
        let serialized = serialize_note(&note.front_matter, "no newline body").unwrap();
        assert!(serialized.ends_with("no newline body\n"));
        assert!(!serialized.ends_with("\n\n"));
    }

    #[test]
    fn test_to_memory() {
        let note = parse_note(VALID_NOTE).unwrap();
        let memory = note.to_memory("abc123", 0).unwrap();
        assert_eq!(memory.id, "decisions:abc123:0");
        assert_eq!(memory.namespace, Namespace::Decisions);
        assert_eq!(memory.summary, "Use PostgreSQL");
        assert_eq!(memory.tags, vec!["database", "infra"]);
        assert_eq!(memory.status, MemoryStatus::Active);
        assert_eq!(memory.spec.as_deref(), Some("auth"));
    }

    #[test]
    fn test_memories_from_blob_indexes_valid_blocks_only() {
        let buffer = format!(
            "{}---\n- list\n- at root\n---\n{}",
            VALID_NOTE,
            VALID_NOTE.replace("Use PostgreSQL", "Second")
        );
        let memories = memories_from_blob(&buffer, "abc123");
        assert_eq!(memories.len(), 2);
        assert_eq!(memories[0].id, "decisions:abc123:0");
        assert_eq!(memories[1].id, "decisions:abc123:1");
        assert_eq!(memories[1].summary, "Second");
    }

    #[test]
    fn test_serialize_memory_round_trip() {
        let note = parse_note(VALID_NOTE).unwrap();
        let memory = note.to_memory("abc123", 0).unwrap();
        let serialized = serialize_memory(&memory).unwrap();
        let reparsed = parse_note(&serialized).unwrap();
        let back = reparsed.to_memory("abc123", 0).unwrap();
        assert_eq!(back.summary, memory.summary);
        assert_eq!(back.tags, memory.tags);
        assert_eq!(back.timestamp, memory.timestamp);
        assert_eq!(back.content, memory.content);
    }
}
