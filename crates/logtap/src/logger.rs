// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Formatting for the agent's own diagnostics on stderr.
//!
//! Delivered entries go to stdout as JSON, so every diagnostic line starts
//! with `LOGTAP` and the level, then the span chain, then the message with
//! the subsystem tag the call site put in front of it:
//!
//! ```text
//! LOGTAP | INFO | TCP | Listening on 127.0.0.1:5170
//! LOGTAP | WARN | HTTP | poll-1 fetch failed: connection refused
//! LOGTAP | ERROR | TCP | Socket error on tcp:127.0.0.1:53112: connection reset by peer
//! LOGTAP | INFO | SHUTDOWN | Clean shutdown
//! ```
//!
//! The agent installs it behind an `EnvFilter` built from `LOGTAP_LOG_LEVEL`:
//!
//! ```rust,ignore
//! let subscriber = tracing_subscriber::fmt::Subscriber::builder()
//!     .with_env_filter(EnvFilter::try_new("reqwest=off,info")?)
//!     .with_writer(std::io::stderr)
//!     .event_format(logtap::logger::Formatter)
//!     .finish();
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

/// Writes `LOGTAP | <level> | ` and then each open span as `name{fields}: `
/// from the root down. Span fields are the ones the fmt layer recorded
/// when the span was created; event fields follow the message.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "LOGTAP | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // Populated by the fmt layer in `new_span`.
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture<F: FnOnce()>(f: F) -> String {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .event_format(Formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_plain_event() {
        let out = capture(|| tracing::info!(port = 5170, "TCP | Listening"));
        assert_eq!(out, "LOGTAP | INFO | TCP | Listening port=5170\n");
    }

    #[test]
    fn test_event_inside_span() {
        let out = capture(|| {
            let span = tracing::info_span!("poller", id = "poll-1");
            let _guard = span.enter();
            tracing::warn!("HTTP | Fetch failed");
        });
        assert_eq!(out, "LOGTAP | WARN | poller{id=\"poll-1\"}: HTTP | Fetch failed\n");
    }

    #[test]
    fn test_nested_spans_without_fields() {
        let out = capture(|| {
            let outer = tracing::info_span!("service");
            let _outer = outer.enter();
            let inner = tracing::debug_span!("connection", peer = "127.0.0.1:53112");
            let _inner = inner.enter();
            tracing::error!("TCP | Socket error");
        });
        assert_eq!(
            out,
            "LOGTAP | ERROR | service: connection{peer=\"127.0.0.1:53112\"}: TCP | Socket error\n"
        );
        assert!(!out.contains('\u{1b}'));
    }
}
