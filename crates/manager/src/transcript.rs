//! Tolerant transcript-record parsing.
//!
//! Transcript files are newline-delimited JSON with a heterogeneous,
//! evolving schema. Unknown discriminants and malformed shapes are routed
//! to `Other`/`None` and skipped by the caller; a bad record never stops
//! tailing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use tether_protocol::TodoItem;

/// Record discriminator. Unknown types parse as `Other` and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    User,
    Assistant,
    System,
    Other,
}

/// One parsed transcript record.
#[derive(Debug)]
pub(crate) struct TranscriptRecord {
    pub(crate) kind: RecordKind,
    pub(crate) is_meta: bool,
    pub(crate) subtype: Option<String>,
    pub(crate) timestamp: Option<DateTime<Utc>>,
    pub(crate) slug: Option<String>,
    pub(crate) todos: Option<Vec<TodoItem>>,
    pub(crate) content: Option<Value>,
}

/// Parse a raw transcript line. Returns `None` for anything that is not a
/// JSON object with a string `type`.
pub(crate) fn parse_record(line: &str) -> Option<TranscriptRecord> {
    let raw: Value = serde_json::from_str(line).ok()?;
    let kind = match raw.get("type").and_then(|v| v.as_str())? {
        "user" => RecordKind::User,
        "assistant" => RecordKind::Assistant,
        "system" => RecordKind::System,
        _ => RecordKind::Other,
    };

    let timestamp = raw
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let todos = raw
        .get("todos")
        .and_then(|v| serde_json::from_value::<Vec<TodoItem>>(v.clone()).ok());

    Some(TranscriptRecord {
        kind,
        is_meta: raw.get("isMeta").and_then(|v| v.as_bool()).unwrap_or(false),
        timestamp,
        subtype: raw
            .get("subtype")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        slug: raw.get("slug").and_then(|v| v.as_str()).map(str::to_string),
        todos,
        content: raw.get("message").and_then(|m| m.get("content")).cloned(),
    })
}

/// Concatenate the textual blocks of a message content value. `content` is
/// either a plain string or a list of typed blocks; only `text` blocks
/// contribute. Returns `None` when nothing textual remains after trimming.
pub(crate) fn message_text(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        let text = text.trim();
        return (!text.is_empty()).then(|| text.to_string());
    }

    let blocks = content.as_array()?;
    let mut parts = Vec::new();
    for block in blocks {
        if block.get("type").and_then(|v| v.as_str()) != Some("text") {
            continue;
        }
        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
            if !text.trim().is_empty() {
                parts.push(text.trim().to_string());
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct ToolUseBlock {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) input: Value,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ToolResultBlock {
    pub(crate) tool_use_id: String,
    pub(crate) content: String,
    pub(crate) is_error: bool,
}

/// Extract `tool_use` blocks from assistant content.
pub(crate) fn tool_use_blocks(content: &Value) -> Vec<ToolUseBlock> {
    let Some(blocks) = content.as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            if block.get("type")?.as_str()? != "tool_use" {
                return None;
            }
            Some(ToolUseBlock {
                id: block.get("id")?.as_str()?.to_string(),
                name: block.get("name")?.as_str()?.to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

/// Extract `tool_result` blocks from user content. Result content may be a
/// plain string or a nested block list; both flatten to text.
pub(crate) fn tool_result_blocks(content: &Value) -> Vec<ToolResultBlock> {
    let Some(blocks) = content.as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            if block.get("type")?.as_str()? != "tool_result" {
                return None;
            }
            let text = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(nested) => message_text(nested).unwrap_or_default(),
                None => String::new(),
            };
            Some(ToolResultBlock {
                tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
                content: text,
                is_error: block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_string_content() {
        let record = parse_record(
            r#"{"type":"user","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":"  hi there  "}}"#,
        )
        .unwrap();
        assert_eq!(record.kind, RecordKind::User);
        assert!(record.timestamp.is_some());
        assert_eq!(
            message_text(record.content.as_ref().unwrap()).as_deref(),
            Some("hi there")
        );
    }

    #[test]
    fn unknown_type_routes_to_other() {
        let record = parse_record(r#"{"type":"summary","summary":"stuff"}"#).unwrap();
        assert_eq!(record.kind, RecordKind::Other);
    }

    #[test]
    fn malformed_line_is_none() {
        assert!(parse_record("not json at all").is_none());
        assert!(parse_record(r#"{"no_type":true}"#).is_none());
    }

    #[test]
    fn concatenates_text_blocks_and_skips_others() {
        let content = json!([
            {"type": "text", "text": "first"},
            {"type": "tool_use", "id": "t1", "name": "Read", "input": {}},
            {"type": "text", "text": " second "}
        ]);
        assert_eq!(message_text(&content).as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn empty_text_is_none() {
        assert_eq!(message_text(&json!("   ")), None);
        assert_eq!(message_text(&json!([{"type": "text", "text": ""}])), None);
    }

    #[test]
    fn extracts_tool_use_blocks() {
        let content = json!([
            {"type": "text", "text": "running"},
            {"type": "tool_use", "id": "call-1", "name": "Bash", "input": {"command": "ls"}}
        ]);
        let calls = tool_use_blocks(&content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].name, "Bash");
    }

    #[test]
    fn extracts_tool_result_blocks_with_nested_content() {
        let content = json!([
            {"type": "tool_result", "tool_use_id": "call-1", "is_error": true,
             "content": [{"type": "text", "text": "exit 1"}]}
        ]);
        let results = tool_result_blocks(&content);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "exit 1");
        assert!(results[0].is_error);
    }

    #[test]
    fn slug_and_todos_fields_are_lifted() {
        let record = parse_record(
            r#"{"type":"system","slug":"refactor","todos":[{"text":"step one","completed":false}]}"#,
        )
        .unwrap();
        assert_eq!(record.slug.as_deref(), Some("refactor"));
        assert_eq!(record.todos.as_ref().unwrap().len(), 1);
    }
}
