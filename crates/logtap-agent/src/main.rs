// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logtap::{
    config::IngestConfig, logger::Formatter, service::IngestService, shutdown::ShutdownOutcome,
    EntrySink, LogEntry,
};

/// Prints every delivered entry to stdout as one JSON object per line.
struct StdoutSink;

impl EntrySink for StdoutSink {
    fn deliver(&self, entries: Vec<LogEntry>) {
        let mut out = std::io::stdout().lock();
        for entry in &entries {
            match serde_json::to_string(entry) {
                // A closed stdout is not worth failing delivery over.
                Ok(line) => {
                    let _ = writeln!(out, "{line}");
                }
                Err(err) => error!("Failed to serialize entry: {err}"),
            }
        }
        let _ = out.flush();
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        config.log_level
    );
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    debug!("Logging subsystem enabled");

    let service = IngestService::start(&config, Arc::new(StdoutSink)).await?;

    if let Some(port) = config.tcp_port {
        let started = service.start_tcp(port).await;
        if !started.ok {
            error!("TCP | {}", started.message);
            service.shutdown().await;
            anyhow::bail!("unable to start TCP listener: {}", started.message);
        }
        info!("TCP | {}", started.message);
    }

    let interval_ms = u64::try_from(config.poll_interval.as_millis()).unwrap_or(u64::MAX);
    for url in &config.poll_urls {
        let started = service.http_start_poll(url, interval_ms);
        if let Some(err) = started.error {
            warn!("HTTP | Not polling {url}: {err}");
        }
    }

    service.health().start_monitoring(config.health_interval);

    tokio::signal::ctrl_c().await?;
    info!("SHUTDOWN | Interrupt received");

    match service.shutdown().await {
        ShutdownOutcome::Completed { failed } if failed.is_empty() => {
            info!("SHUTDOWN | Clean shutdown")
        }
        ShutdownOutcome::Completed { failed } => {
            warn!("SHUTDOWN | Teardown failures: {}", failed.join(", "))
        }
        ShutdownOutcome::TimedOut => warn!("SHUTDOWN | Forced after timeout"),
        ShutdownOutcome::AlreadyRequested => {}
    }
    Ok(())
}
