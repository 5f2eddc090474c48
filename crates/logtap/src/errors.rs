// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned directly to callers of the ingestion service.
///
/// Only caller-initiated one-shot actions fail this way. Failures inside
/// running components become synthetic entries or status values instead.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TCP listener already running on port {0}")]
    AlreadyRunning(u16),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Poller not found: {0}")]
    PollerNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Delivery pipeline is closed")]
    PipelineClosed,

    #[error("Failed to open output file {path}: {source}")]
    OutputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single HTTP fetch failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

/// Outcome of a call rejected or failed under a circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is open, or a half-open trial is already in flight.
    #[error("Circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write discarded: queue cleared")]
    QueueCleared,

    #[error("File writer is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Requested {requested} tokens but bucket holds at most {max}")]
    ExceedsCapacity { requested: u64, max: u64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value '{value}' for {var}")]
    InvalidValue { var: &'static str, value: String },
}
