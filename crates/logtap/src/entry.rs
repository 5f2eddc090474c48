// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The normalized record shape shared by every component.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Log severity, normalized across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Lenient, case-insensitive parse of the level names producers use.
    ///
    /// ```
    /// use logtap::LogLevel;
    ///
    /// assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
    /// assert_eq!(LogLevel::parse(" err "), Some(LogLevel::Error));
    /// assert_eq!(LogLevel::parse("verbose"), Some(LogLevel::Trace));
    /// assert_eq!(LogLevel::parse("loud"), None);
    /// ```
    pub fn parse(value: &str) -> Option<LogLevel> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" | "verbose" | "finest" | "finer" => Some(LogLevel::Trace),
            "debug" | "fine" | "config" => Some(LogLevel::Debug),
            "info" | "information" | "notice" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" | "severe" => Some(LogLevel::Error),
            "fatal" | "critical" | "crit" | "alert" | "emergency" | "panic" => {
                Some(LogLevel::Fatal)
            }
            _ => None,
        }
    }

    /// Maps pino/bunyan numeric levels (10 = trace ... 60 = fatal).
    pub fn from_numeric(value: i64) -> LogLevel {
        match value {
            i64::MIN..=10 => LogLevel::Trace,
            11..=20 => LogLevel::Debug,
            21..=30 => LogLevel::Info,
            31..=40 => LogLevel::Warn,
            41..=50 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the payload an entry was built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RawPayload {
    /// A structured record (one JSON object).
    Json(Arc<serde_json::Value>),
    /// A plain text line.
    Text(Arc<str>),
    /// Produced by the core itself (socket errors, rejections, timeouts).
    #[default]
    Synthetic,
}

/// A normalized log entry.
///
/// Built once by the [`normalizer`](crate::normalizer) and never mutated
/// afterwards. `message` is always present (possibly empty) and `source` is
/// never empty: `tcp:<addr>:<port>` for socket input, the URL for polled
/// input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub source: String,
    /// Set when the record carried no usable timestamp and ingest time was
    /// used instead.
    #[serde(skip)]
    pub inferred_timestamp: bool,
    #[serde(skip)]
    pub raw: RawPayload,
}

impl LogEntry {
    /// Builds an entry generated by the core rather than by a producer.
    pub fn synthetic(level: LogLevel, message: impl Into<String>, source: &str) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            level,
            logger: Some("logtap".to_string()),
            thread: None,
            message: message.into(),
            trace_id: None,
            stack_trace: None,
            source: crate::normalizer::source_or_unknown(source),
            inferred_timestamp: true,
            raw: RawPayload::Synthetic,
        }
    }

    /// Stable identity used to suppress re-delivery across HTTP polls.
    ///
    /// Covers timestamp, level, logger, thread, message, trace id and source.
    /// An inferred timestamp is left out of the key: it changes on every
    /// fetch and would defeat deduplication for records without one.
    pub fn dedup_key(&self) -> String {
        let timestamp = if self.inferred_timestamp {
            String::new()
        } else {
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        };
        serde_json::json!([
            timestamp,
            self.level.as_str(),
            self.logger,
            self.thread,
            self.message,
            self.trace_id,
            self.source,
        ])
        .to_string()
    }
}

/// Presentation-side consumer of delivered batches.
///
/// Implementations must not block and must not panic; they are called from
/// the pipeline's delivery task.
pub trait EntrySink: Send + Sync + 'static {
    fn deliver(&self, entries: Vec<LogEntry>);

    /// Returns `false` while the consumer cannot take more entries. The
    /// pipeline keeps them buffered and retries on the next delivery tick.
    fn is_ready(&self) -> bool {
        true
    }
}

impl<F> EntrySink for F
where
    F: Fn(Vec<LogEntry>) + Send + Sync + 'static,
{
    fn deliver(&self, entries: Vec<LogEntry>) {
        self(entries)
    }
}
