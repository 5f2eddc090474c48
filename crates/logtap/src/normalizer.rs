// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw parsed records and plain text lines into [`LogEntry`] values.
//!
//! Producers disagree on field names, so each canonical field is looked up
//! under a list of common aliases. The first alias present wins.

use crate::entry::{LogEntry, LogLevel, RawPayload};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "@timestamp", "time", "ts", "date"];
const LEVEL_KEYS: &[&str] = &["level", "severity", "lvl", "loglevel", "levelname"];
const LOGGER_KEYS: &[&str] = &["logger", "logger_name", "loggerName", "name", "category"];
const THREAD_KEYS: &[&str] = &["thread", "thread_name", "threadName"];
const MESSAGE_KEYS: &[&str] = &["message", "msg"];
const TRACE_ID_KEYS: &[&str] = &["traceId", "trace_id", "traceid", "dd.trace_id"];
const STACK_TRACE_KEYS: &[&str] = &["stackTrace", "stack_trace", "stack", "exception", "err"];

/// Epoch values above this are treated as milliseconds (year 5138 in seconds).
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

lazy_static! {
    /// Level keyword anywhere in a plain text line.
    static ref LEVEL_REGEX: Regex =
        Regex::new(r"(?i)\b(TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL|CRITICAL)\b")
            .expect("failed creating regex");

    /// Leading ISO-8601 style timestamp in a plain text line.
    static ref LEADING_TIMESTAMP_REGEX: Regex = Regex::new(
        r"^\[?(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)"
    )
    .expect("failed creating regex");
}

/// Returns `source`, or `"unknown"` when it is blank.
pub fn source_or_unknown(source: &str) -> String {
    if source.trim().is_empty() {
        "unknown".to_string()
    } else {
        source.to_string()
    }
}

/// Normalizes one structured record.
///
/// `fallback_message` is used when the record carries no message field,
/// typically the original line the record was parsed from. Non-object values
/// are accepted: strings go through [`normalize_text`] and anything else
/// becomes the message verbatim.
pub fn normalize(raw: Value, fallback_message: &str, source: &str) -> LogEntry {
    let fields = match &raw {
        Value::Object(fields) => fields,
        Value::String(text) => return normalize_text(text, source),
        other => {
            let message = other.to_string();
            return LogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Info,
                logger: None,
                thread: None,
                message,
                trace_id: None,
                stack_trace: None,
                source: source_or_unknown(source),
                inferred_timestamp: true,
                raw: RawPayload::Json(Arc::new(raw)),
            };
        }
    };

    let parsed_timestamp = lookup(fields, TIMESTAMP_KEYS).and_then(parse_timestamp);
    let level = lookup(fields, LEVEL_KEYS)
        .and_then(parse_level)
        .unwrap_or(LogLevel::Info);
    let message = match lookup(fields, MESSAGE_KEYS) {
        Some(Value::String(message)) => message.clone(),
        Some(other) => other.to_string(),
        None => fallback_message.to_string(),
    };

    LogEntry {
        timestamp: parsed_timestamp.unwrap_or_else(Utc::now),
        level,
        logger: lookup(fields, LOGGER_KEYS).and_then(as_text),
        thread: lookup(fields, THREAD_KEYS).and_then(as_text),
        message,
        trace_id: lookup(fields, TRACE_ID_KEYS).and_then(as_text),
        stack_trace: lookup(fields, STACK_TRACE_KEYS).and_then(stack_text),
        source: source_or_unknown(source),
        inferred_timestamp: parsed_timestamp.is_none(),
        raw: RawPayload::Json(Arc::new(raw)),
    }
}

/// Normalizes a plain text line.
///
/// The whole line is kept as the message. A level keyword anywhere in the
/// line sets the level (INFO otherwise) and a leading timestamp, if any, is
/// used as the entry timestamp.
pub fn normalize_text(line: &str, source: &str) -> LogEntry {
    let level = LEVEL_REGEX
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|keyword| LogLevel::parse(keyword.as_str()))
        .unwrap_or(LogLevel::Info);
    let parsed_timestamp = LEADING_TIMESTAMP_REGEX
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|stamp| parse_timestamp_str(stamp.as_str()));

    LogEntry {
        timestamp: parsed_timestamp.unwrap_or_else(Utc::now),
        level,
        logger: None,
        thread: None,
        message: line.to_string(),
        trace_id: None,
        stack_trace: None,
        source: source_or_unknown(source),
        inferred_timestamp: parsed_timestamp.is_none(),
        raw: RawPayload::Text(Arc::from(line)),
    }
}

fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

// Error objects (pino's `err`, exception wrappers) carry the trace in `stack`.
fn stack_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(fields) => match fields.get("stack") {
            Some(Value::String(stack)) => Some(stack.clone()),
            _ => Some(value.to_string()),
        },
        Value::Array(frames) => Some(
            frames
                .iter()
                .map(|frame| match frame {
                    Value::String(frame) => frame.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        other => as_text(other),
    }
}

fn parse_level(value: &Value) -> Option<LogLevel> {
    match value {
        Value::String(name) => LogLevel::parse(name)
            .or_else(|| name.trim().parse::<i64>().ok().map(LogLevel::from_numeric)),
        Value::Number(number) => number.as_i64().map(LogLevel::from_numeric),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_timestamp_str(text),
        Value::Number(number) => number.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim().replace(',', ".");
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&text) {
        return Some(timestamp.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(timestamp) = DateTime::parse_from_str(&text, format) {
            return Some(timestamp.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    text.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value > EPOCH_MILLIS_CUTOFF {
        value
    } else {
        value * 1_000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}
