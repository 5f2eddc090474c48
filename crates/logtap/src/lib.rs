// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logtap
//!
//! Live log ingestion core. Records arrive from two kinds of live sources, a
//! newline-delimited TCP stream and periodically polled HTTP endpoints, get
//! normalized into [`LogEntry`] values and are delivered to a presentation sink
//! through a bounded, adaptively paced pipeline.
//!
//! ## Architecture
//!
//! ```text
//!   TCP sockets ──┐                          ┌──> EntrySink (presentation)
//!                 ├─> Normalizer ─> Pipeline ┤
//!   HTTP pollers ─┘   (parser)               └──> AsyncFileWriter (append-only)
//!        │
//!        └─ CircuitBreaker per poller, optional RateLimiter per source
//! ```
//!
//! [`health::HealthMonitor`] and [`shutdown::ShutdownCoordinator`] observe and
//! tear down the other components; [`service::IngestService`] wires everything
//! together and exposes the collaborator-facing API.
//!
//! ## Resource bounds
//!
//! - Per-connection line buffer: [`constants::MAX_BUFFER_SIZE`]
//! - Maximum line length: [`constants::MAX_LINE_LENGTH`]
//! - Simultaneous TCP connections: [`constants::MAX_CONNECTIONS`]
//! - Buffered pipeline entries: [`constants::PIPELINE_CAPACITY`]
//! - Dedup history per poller: [`constants::MAX_SEEN_KEYS`]

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod entry;
pub mod errors;
pub mod file_writer;
pub mod health;
pub mod http_poller;
pub mod logger;
pub mod normalizer;
pub mod parser;
pub mod pipeline;
pub mod rate_limiter;
pub mod service;
pub mod shutdown;
pub mod tcp;

pub use entry::{EntrySink, LogEntry, LogLevel, RawPayload};
