// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource limits and timing defaults shared by the ingestion components.
//!
//! Every bound the core enforces on memory, connections or scheduling lives
//! here so the components and their tests agree on the same numbers.

use std::time::Duration;

/// Maximum number of unflushed bytes held for a single TCP connection.
///
/// # Value: 1MiB (1,048,576 bytes)
///
/// When a chunk pushes the buffer past this size without a line terminator,
/// the buffer is trimmed to its trailing half. This is lossy by intent: one
/// runaway producer cannot grow the process heap.
pub const MAX_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Maximum length in bytes of a single line.
///
/// # Value: 100KiB (102,400 bytes)
///
/// Longer lines are dropped with a diagnostic log event. The connection stays
/// open.
pub const MAX_LINE_LENGTH: usize = 100 * 1_024;

/// Maximum number of simultaneously tracked TCP connections.
///
/// Connections accepted beyond this bound are closed immediately and a WARN
/// diagnostic entry is routed through the pipeline.
pub const MAX_CONNECTIONS: usize = 1_000;

/// Idle time after which a TCP connection is force-closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Read chunk size for socket reads.
pub(crate) const READ_CHUNK_SIZE: usize = 64 * 1_024;

/// Floor applied to every poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-request timeout for HTTP fetches.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of dedup keys a poller remembers before trimming.
///
/// Once exceeded, the oldest half of the history is discarded. A very old
/// record may then be delivered twice; new records are never lost.
pub const MAX_SEEN_KEYS: usize = 10_000;

/// Soft cap on entries buffered by the delivery pipeline.
pub const PIPELINE_CAPACITY: usize = 5_000;

/// Entries handed to the sink per batch.
pub const BATCH_SIZE: usize = 500;

/// Lower bound of the adaptive batch delay. Never zero.
pub const MIN_DELAY: Duration = Duration::from_millis(16);

/// Upper bound of the adaptive batch delay.
pub const MAX_DELAY: Duration = Duration::from_millis(1_000);

/// Batch delay used before any processing time has been observed.
pub const INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Average processing time above which the delay grows.
pub const SLOW_PROCESSING_THRESHOLD: Duration = Duration::from_millis(50);

/// Processing time every sample must stay under for the delay to shrink.
pub const FAST_PROCESSING_THRESHOLD: Duration = Duration::from_millis(10);

/// Length of the rolling processing-time history.
pub const PROCESSING_HISTORY_LEN: usize = 10;

/// Minimum spacing between two "buffer full" warnings.
pub const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for a single health check.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the whole shutdown sequence.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
