// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named health checks, run on demand or on a fixed interval.
//!
//! Each check is an async predicate with its own timeout. A check that
//! returns an error, panics or times out is reported as
//! [`HealthStatus::Error`], which is distinct from a check that ran and
//! reported [`HealthStatus::Unhealthy`]. The overall status of a report is the
//! worst status of its checks.

use crate::constants;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of one check or of the whole process, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// The check itself failed to produce an answer.
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a check reports when it runs to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl CheckOutcome {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

pub type CheckFuture = Pin<Box<dyn Future<Output = anyhow::Result<CheckOutcome>> + Send>>;

/// Type-erased async health predicate.
pub type HealthCheckFn = Arc<dyn Fn() -> CheckFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

#[derive(Clone)]
struct RegisteredCheck {
    name: String,
    check: HealthCheckFn,
    timeout: Duration,
}

struct MonitoringTask {
    cancel: CancellationToken,
}

pub struct HealthMonitor {
    checks: Mutex<Vec<RegisteredCheck>>,
    last_report: Mutex<Option<HealthReport>>,
    monitoring: Mutex<Option<MonitoringTask>>,
    default_timeout: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(constants::HEALTH_CHECK_TIMEOUT)
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            checks: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
            monitoring: Mutex::new(None),
            default_timeout,
        }
    }

    #[allow(clippy::expect_used)]
    fn checks(&self) -> MutexGuard<'_, Vec<RegisteredCheck>> {
        self.checks.lock().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn last(&self) -> MutexGuard<'_, Option<HealthReport>> {
        self.last_report.lock().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn monitoring(&self) -> MutexGuard<'_, Option<MonitoringTask>> {
        self.monitoring.lock().expect("lock poisoned")
    }

    /// Registers `check` under `name`, replacing any check of that name.
    /// `timeout` defaults to the monitor's default (5s).
    pub fn register_check<F, Fut>(&self, name: impl Into<String>, check: F, timeout: Option<Duration>)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CheckOutcome>> + Send + 'static,
    {
        let check: HealthCheckFn = Arc::new(move || Box::pin(check()) as CheckFuture);
        self.register_check_fn(name, check, timeout);
    }

    pub fn register_check_fn(
        &self,
        name: impl Into<String>,
        check: HealthCheckFn,
        timeout: Option<Duration>,
    ) {
        let registered = RegisteredCheck {
            name: name.into(),
            check,
            timeout: timeout.unwrap_or(self.default_timeout),
        };
        let mut checks = self.checks();
        match checks.iter_mut().find(|c| c.name == registered.name) {
            Some(existing) => *existing = registered,
            None => checks.push(registered),
        }
    }

    pub fn unregister_check(&self, name: &str) -> bool {
        let mut checks = self.checks();
        let before = checks.len();
        checks.retain(|c| c.name != name);
        checks.len() != before
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks().iter().map(|c| c.name.clone()).collect()
    }

    /// Runs every registered check concurrently and records the report.
    pub async fn run_checks(&self) -> HealthReport {
        let checks = self.checks().clone();

        let mut set = JoinSet::new();
        for (index, registered) in checks.into_iter().enumerate() {
            set.spawn(async move { (index, run_one(registered).await) });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            // run_one never panics; a JoinError here means runtime shutdown.
            if let Ok(result) = joined {
                results.push(result);
            }
        }
        results.sort_by_key(|(index, _)| *index);
        let checks: Vec<CheckResult> = results.into_iter().map(|(_, result)| result).collect();

        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let report = HealthReport {
            status,
            checks,
            checked_at: Utc::now(),
        };

        let previous = self.last().replace(report.clone()).map(|r| r.status);
        match previous {
            Some(previous) if previous != status => {
                if status > previous {
                    warn!("HEALTH | Status changed from {previous} to {status}");
                } else {
                    info!("HEALTH | Status changed from {previous} to {status}");
                }
            }
            None => debug!("HEALTH | Initial status {status}"),
            _ => {}
        }
        report
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last().clone()
    }

    /// Runs one pass immediately, then one every `interval`, until
    /// [`HealthMonitor::stop_monitoring`]. Returns `false` if monitoring was
    /// already running.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> bool {
        let mut monitoring = self.monitoring();
        if monitoring.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = monitor.run_checks() => {}
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            debug!("HEALTH | Monitoring stopped");
        });
        *monitoring = Some(MonitoringTask { cancel });
        info!("HEALTH | Monitoring every {}ms", interval.as_millis());
        true
    }

    /// Stops periodic monitoring. Safe to call at any time, any number of
    /// times; returns whether monitoring was running.
    pub fn stop_monitoring(&self) -> bool {
        match self.monitoring().take() {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring().is_some()
    }
}

async fn run_one(registered: RegisteredCheck) -> CheckResult {
    let started = Instant::now();
    // The check runs in its own task so a panic is contained.
    let mut task = tokio::spawn((registered.check)());
    let joined = tokio::time::timeout(registered.timeout, &mut task).await;
    let (status, message) = match joined {
        Ok(Ok(Ok(outcome))) => (outcome.status, outcome.message),
        Ok(Ok(Err(err))) => (HealthStatus::Error, Some(format!("{err:#}"))),
        Ok(Err(join_err)) if join_err.is_panic() => {
            (HealthStatus::Error, Some("check panicked".to_string()))
        }
        Ok(Err(join_err)) => (HealthStatus::Error, Some(join_err.to_string())),
        Err(_) => {
            task.abort();
            (
                HealthStatus::Error,
                Some(format!(
                    "timed out after {}ms",
                    registered.timeout.as_millis()
                )),
            )
        }
    };
    if status == HealthStatus::Error {
        debug!(
            "HEALTH | Check {} errored: {}",
            registered.name,
            message.as_deref().unwrap_or_default()
        );
    }
    CheckResult {
        name: registered.name,
        status,
        message,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}
