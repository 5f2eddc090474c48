// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered teardown of the ingestion components.

use crate::constants;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type TeardownFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type TeardownAction = Box<dyn FnOnce() -> TeardownFuture + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every action ran. `failed` names the ones that returned an error.
    Completed { failed: Vec<String> },
    /// The overall deadline passed; remaining actions were abandoned.
    TimedOut,
    /// Shutdown was already requested by an earlier call.
    AlreadyRequested,
}

pub struct ShutdownCoordinator {
    actions: Mutex<Vec<(String, TeardownAction)>>,
    requested: AtomicBool,
    finished: CancellationToken,
    timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(constants::SHUTDOWN_TIMEOUT)
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            requested: AtomicBool::new(false),
            finished: CancellationToken::new(),
            timeout,
        }
    }

    #[allow(clippy::expect_used)]
    fn actions(&self) -> MutexGuard<'_, Vec<(String, TeardownAction)>> {
        self.actions.lock().expect("lock poisoned")
    }

    /// Appends a teardown action. Actions run in registration order. Returns
    /// `false`, dropping the action, once shutdown has been requested.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut actions = self.actions();
        if self.requested.load(Ordering::SeqCst) {
            warn!("SHUTDOWN | Ignoring teardown {name} registered during shutdown");
            return false;
        }
        actions.push((name, Box::new(move || Box::pin(action()) as TeardownFuture)));
        true
    }

    pub fn registered(&self) -> Vec<String> {
        self.actions().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a shutdown pass has finished, completed or forced.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    /// Runs every registered action in order, continuing past failures, within
    /// the overall timeout. Only the first call does any work.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let actions = {
            let mut actions = self.actions();
            if self.requested.swap(true, Ordering::SeqCst) {
                debug!("SHUTDOWN | Already requested");
                return ShutdownOutcome::AlreadyRequested;
            }
            std::mem::take(&mut *actions)
        };
        info!("SHUTDOWN | Running {} teardown actions", actions.len());

        let run = async move {
            let mut failed = Vec::new();
            for (name, action) in actions {
                debug!("SHUTDOWN | Running {name}");
                if let Err(err) = action().await {
                    error!("SHUTDOWN | Teardown {name} failed: {err:#}");
                    failed.push(name);
                }
            }
            failed
        };

        let outcome = match tokio::time::timeout(self.timeout, run).await {
            Ok(failed) => {
                info!("SHUTDOWN | Complete ({} failed)", failed.len());
                ShutdownOutcome::Completed { failed }
            }
            Err(_) => {
                warn!(
                    "SHUTDOWN | Timed out after {}ms, forcing completion",
                    self.timeout.as_millis()
                );
                ShutdownOutcome::TimedOut
            }
        };
        self.finished.cancel();
        outcome
    }
}
