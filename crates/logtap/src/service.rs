// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collaborator-facing facade over the ingestion components.
//!
//! [`IngestService::start`] spawns the pipeline (and file writer when an
//! output file is configured), builds the TCP ingestor and HTTP poller on top
//! of it, registers the built-in health checks and the default teardown
//! sequence. Every operation returns a serializable camelCase response so
//! callers can forward results as-is.

use crate::circuit_breaker::CircuitState;
use crate::config::IngestConfig;
use crate::entry::{EntrySink, LogEntry};
use crate::errors::IngestError;
use crate::file_writer::{FileWriterHandle, FileWriterService, WriterStats};
use crate::health::{CheckOutcome, HealthMonitor, HealthStatus};
use crate::http_poller::{HttpPoller, PollerDetails};
use crate::pipeline::{PipelineHandle, PipelineService, PipelineStats};
use crate::rate_limiter::RateLimiter;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::tcp::{TcpIngestor, TcpStatus};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Share of the connection ceiling above which the tcp check degrades.
const CONNECTION_PRESSURE_PERCENT: usize = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpStartResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpStopResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<LogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPollResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDiagnostics {
    pub active_pollers: usize,
    pub poller_details: Vec<PollerDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub tcp: TcpStatus,
    pub http: HttpDiagnostics,
    /// Absent once the pipeline has shut down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer: Option<WriterStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<u64>,
}

pub struct IngestService {
    pipeline: PipelineHandle,
    writer: Option<FileWriterHandle>,
    limiter: Option<Arc<RateLimiter>>,
    tcp: Arc<TcpIngestor>,
    poller: Arc<HttpPoller>,
    health: Arc<HealthMonitor>,
    shutdown: ShutdownCoordinator,
}

impl IngestService {
    /// Spawns the delivery side and wires the sources to it. Nothing listens
    /// or polls until [`IngestService::start_tcp`] or
    /// [`IngestService::http_start_poll`] is called.
    pub async fn start(
        config: &IngestConfig,
        sink: Arc<dyn EntrySink>,
    ) -> Result<Self, IngestError> {
        config.validate()?;

        let writer = match &config.output_file {
            Some(path) => {
                let (service, handle) =
                    FileWriterService::open(path)
                        .await
                        .map_err(|source| IngestError::OutputFile {
                            path: path.display().to_string(),
                            source,
                        })?;
                tokio::spawn(service.run());
                Some(handle)
            }
            None => None,
        };

        let (service, pipeline) = PipelineService::new(&config.pipeline, sink, writer.clone());
        tokio::spawn(service.run());

        let limiter = config
            .rate_limit
            .clone()
            .map(|limit| Arc::new(RateLimiter::new(limit)));
        let tcp = Arc::new(TcpIngestor::new(
            config.tcp.clone(),
            pipeline.clone(),
            limiter.clone(),
        ));
        let poller = Arc::new(HttpPoller::new(
            config.poller.clone(),
            pipeline.clone(),
            limiter.clone(),
        )?);

        let service = Self {
            pipeline,
            writer,
            limiter,
            tcp,
            poller,
            health: Arc::new(HealthMonitor::default()),
            shutdown: ShutdownCoordinator::new(config.shutdown_timeout),
        };
        service.register_health_checks(config.tcp.max_connections);
        service.register_default_teardown();
        debug!("PIPELINE | Ingest service ready");
        Ok(service)
    }

    pub async fn start_tcp(&self, port: u16) -> TcpStartResponse {
        match self.tcp.start(port).await {
            Ok(port) => TcpStartResponse {
                ok: true,
                message: format!("Listening on port {port}"),
                port: Some(port),
            },
            Err(err) => TcpStartResponse {
                ok: false,
                message: err.to_string(),
                port: None,
            },
        }
    }

    pub async fn stop_tcp(&self) -> TcpStopResponse {
        if self.tcp.stop().await {
            TcpStopResponse {
                ok: true,
                message: "TCP listener stopped".to_string(),
            }
        } else {
            TcpStopResponse {
                ok: false,
                message: "TCP listener is not running".to_string(),
            }
        }
    }

    pub async fn tcp_status(&self) -> TcpStatus {
        self.tcp.status().await
    }

    /// Fetches `url` once and returns the parsed entries to the caller. The
    /// entries are not pushed to the pipeline.
    pub async fn http_load_once(&self, url: &str) -> LoadResponse {
        match self.poller.load_once(url).await {
            Ok(entries) => LoadResponse {
                ok: true,
                entries: Some(entries),
                error: None,
            },
            Err(err) => LoadResponse {
                ok: false,
                entries: None,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn http_start_poll(&self, url: &str, interval_ms: u64) -> StartPollResponse {
        match self
            .poller
            .start_poll(url, Duration::from_millis(interval_ms))
        {
            Ok(id) => StartPollResponse {
                ok: true,
                id: Some(id.as_str().to_string()),
                error: None,
            },
            Err(err) => StartPollResponse {
                ok: false,
                id: None,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn http_stop_poll(&self, id: &str) -> StopPollResponse {
        match self.poller.stop_poll(id) {
            Ok(()) => StopPollResponse {
                ok: true,
                error: None,
            },
            Err(err) => StopPollResponse {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let writer = match &self.writer {
            Some(writer) => writer.stats().await.ok(),
            None => None,
        };
        Diagnostics {
            tcp: self.tcp.status().await,
            http: HttpDiagnostics {
                active_pollers: self.poller.active_count(),
                poller_details: self.poller.details(),
            },
            pipeline: self.pipeline.stats().await.ok(),
            writer,
            throttled: self.limiter.as_ref().map(|l| l.throttled_count()),
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Producer handle for callers feeding entries from their own sources.
    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Appends a teardown action. It runs after the built-in sequence, so
    /// every entry has been delivered by the time it is called.
    pub fn register_teardown<F, Fut>(&self, name: impl Into<String>, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shutdown.register(name, action)
    }

    pub async fn shutdown(&self) -> ShutdownOutcome {
        info!("SHUTDOWN | Shutting down ingest service");
        self.shutdown.shutdown().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    fn register_health_checks(&self, max_connections: usize) {
        let tcp = Arc::clone(&self.tcp);
        self.health.register_check(
            "tcp",
            move || {
                let tcp = Arc::clone(&tcp);
                async move { check_tcp(&tcp, max_connections).await }
            },
            None,
        );

        let pipeline = self.pipeline.clone();
        self.health.register_check(
            "pipeline",
            move || {
                let pipeline = pipeline.clone();
                async move { check_pipeline(&pipeline).await }
            },
            None,
        );

        let poller = Arc::clone(&self.poller);
        self.health.register_check(
            "pollers",
            move || {
                let details = poller.details();
                async move { check_pollers(&details) }
            },
            None,
        );

        let writer = self.writer.clone();
        self.health.register_check(
            "writer",
            move || {
                let writer = writer.clone();
                async move { check_writer(writer.as_ref()).await }
            },
            None,
        );
    }

    fn register_default_teardown(&self) {
        let poller = Arc::clone(&self.poller);
        self.shutdown.register("pollers", move || async move {
            poller.stop_all();
            Ok(())
        });

        let tcp = Arc::clone(&self.tcp);
        self.shutdown.register("tcp", move || async move {
            tcp.stop().await;
            Ok(())
        });

        let pipeline = self.pipeline.clone();
        self.shutdown.register("pipeline", move || async move {
            pipeline.shutdown().await.map_err(anyhow::Error::from)
        });

        if let Some(writer) = self.writer.clone() {
            self.shutdown.register("writer", move || async move {
                writer.shutdown().await.map_err(anyhow::Error::from)
            });
        }

        let health = Arc::clone(&self.health);
        self.shutdown.register("health", move || async move {
            health.stop_monitoring();
            Ok(())
        });
    }
}

async fn check_tcp(tcp: &TcpIngestor, max_connections: usize) -> anyhow::Result<CheckOutcome> {
    let status = tcp.status().await;
    if !status.running {
        return Ok(CheckOutcome {
            status: HealthStatus::Healthy,
            message: Some("listener not running".to_string()),
        });
    }
    if status.active_connections * 100 >= max_connections * CONNECTION_PRESSURE_PERCENT {
        return Ok(CheckOutcome::degraded(format!(
            "{} of {max_connections} connections in use",
            status.active_connections
        )));
    }
    Ok(CheckOutcome::healthy())
}

async fn check_pipeline(pipeline: &PipelineHandle) -> anyhow::Result<CheckOutcome> {
    let stats = pipeline.stats().await?;
    if stats.buffered >= stats.capacity {
        return Ok(CheckOutcome::degraded(format!(
            "buffer full at {} entries, {} dropped",
            stats.capacity, stats.dropped
        )));
    }
    Ok(CheckOutcome::healthy())
}

fn check_pollers(details: &[PollerDetails]) -> anyhow::Result<CheckOutcome> {
    let open = details
        .iter()
        .filter(|d| d.circuit_state == CircuitState::Open)
        .count();
    Ok(match open {
        0 => CheckOutcome::healthy(),
        n if n == details.len() => {
            CheckOutcome::unhealthy(format!("all {n} pollers have an open circuit"))
        }
        n => CheckOutcome::degraded(format!(
            "{n} of {} pollers have an open circuit",
            details.len()
        )),
    })
}

async fn check_writer(writer: Option<&FileWriterHandle>) -> anyhow::Result<CheckOutcome> {
    let Some(writer) = writer else {
        return Ok(CheckOutcome {
            status: HealthStatus::Healthy,
            message: Some("no output file".to_string()),
        });
    };
    let stats = writer.stats().await?;
    if stats.failed > 0 {
        return Ok(CheckOutcome::degraded(format!(
            "{} writes failed",
            stats.failed
        )));
    }
    Ok(CheckOutcome::healthy())
}
