// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line classification and whole-body parsing.

use crate::entry::LogEntry;
use crate::normalizer::{normalize, normalize_text};
use serde_json::Value;

/// Envelope keys under which HTTP endpoints commonly nest their records.
const ENVELOPE_KEYS: &[&str] = &["logs", "entries", "records", "items", "data"];

/// Outcome of classifying one line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// The line is a JSON object.
    Structured(Value),
    PlainText(String),
}

impl ParsedLine {
    /// Normalizes the classified line into exactly one entry. `line` is the
    /// fallback message for a structured record without one.
    pub fn into_entry(self, source: &str, line: &str) -> LogEntry {
        match self {
            ParsedLine::Structured(record) => normalize(record, line, source),
            ParsedLine::PlainText(text) => normalize_text(&text, source),
        }
    }
}

/// Best-effort classification: a line that parses as a JSON object is
/// structured, anything else (arrays and scalars included) is plain text.
pub fn classify_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            return ParsedLine::Structured(value);
        }
    }
    ParsedLine::PlainText(line.to_string())
}

/// Parses one framed line into its entry.
pub fn parse_line(source: &str, line: &str) -> LogEntry {
    classify_line(line).into_entry(source, line)
}

/// Parses a whole body (an HTTP response).
///
/// Accepted shapes, tried in order:
/// - a JSON array of records;
/// - a JSON object, either one record or an envelope holding a record array
///   under `logs`, `entries`, `records`, `items` or `data`;
/// - newline-delimited input, each line classified on its own.
///
/// Blank input yields no entries. Source order is preserved.
pub fn parse_body(source: &str, text: &str) -> Vec<LogEntry> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(records)) => {
                return records
                    .into_iter()
                    .map(|record| normalize_record(record, source))
                    .collect();
            }
            Ok(Value::Object(mut fields)) => {
                let envelope = ENVELOPE_KEYS
                    .iter()
                    .find(|key| matches!(fields.get(**key), Some(Value::Array(_))));
                if let Some(key) = envelope {
                    if let Some(Value::Array(records)) = fields.remove(*key) {
                        return records
                            .into_iter()
                            .map(|record| normalize_record(record, source))
                            .collect();
                    }
                }
                return vec![normalize(Value::Object(fields), trimmed, source)];
            }
            // Not a single JSON document: fall through to line-wise parsing.
            _ => {}
        }
    }

    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_line(source, line))
        .collect()
}

fn normalize_record(record: Value, source: &str) -> LogEntry {
    let fallback = match &record {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    normalize(record, &fallback, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;
    use serde_json::json;

    #[test]
    fn test_classify_line() {
        assert_eq!(
            classify_line(r#"{"message":"hi"}"#),
            ParsedLine::Structured(json!({"message": "hi"}))
        );
        assert_eq!(
            classify_line("{not json"),
            ParsedLine::PlainText("{not json".to_string())
        );
        assert_eq!(
            classify_line("42"),
            ParsedLine::PlainText("42".to_string())
        );
    }

    #[test]
    fn test_parse_json_array_keeps_order() {
        let entries = parse_body(
            "http://h/logs",
            r#"[{"message":"one"},{"message":"two"},{"message":"three"}]"#,
        );
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert!(entries.iter().all(|e| e.source == "http://h/logs"));
    }

    #[test]
    fn test_parse_single_object() {
        let entries = parse_body("s", r#"{"msg":"solo","level":"debug"}"#);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "solo");
        assert_eq!(entries[0].level, LogLevel::Debug);
    }

    #[test]
    fn test_parse_envelope() {
        let entries = parse_body("s", r#"{"total":2,"logs":[{"msg":"a"},{"msg":"b"}]}"#);
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_ndjson_with_plain_lines() {
        let body = "{\"msg\":\"first\"}\r\n\nplain ERROR line\n{\"msg\":\"last\"}\n";
        let entries = parse_body("s", body);
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "plain ERROR line", "last"]);
        assert_eq!(entries[1].level, LogLevel::Error);
    }

    #[test]
    fn test_parse_blank_body() {
        assert!(parse_body("s", "  \n\n").is_empty());
    }

    #[test]
    fn test_array_line_is_one_plain_entry() {
        assert_eq!(
            classify_line("[1,2]"),
            ParsedLine::PlainText("[1,2]".to_string())
        );
        let entry = parse_line("s", "[]");
        assert_eq!(entry.message, "[]");
        let entry = parse_line("s", r#"[{"msg":"a"},"b"]"#);
        assert_eq!(entry.message, r#"[{"msg":"a"},"b"]"#);
    }

    #[test]
    fn test_object_line_without_message_falls_back_to_line() {
        let entry = parse_line("s", r#"{"level":"warn"}"#);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, r#"{"level":"warn"}"#);
    }

    #[test]
    fn test_array_lines_inside_ndjson_body_stay_whole() {
        let entries = parse_body("s", "[]\n[1,2,3]\nlast\n");
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["[]", "[1,2,3]", "last"]);
    }
}
