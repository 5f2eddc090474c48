// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic circuit breaker.
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[timeout elapsed since last failure]------> HalfOpen
//! HalfOpen --[success_threshold consecutive successes]-> Closed
//! HalfOpen --[any failure]-----------------------------> Open
//! ```
//!
//! While open, [`CircuitBreaker::execute`] rejects without running the
//! operation. While half-open, a single trial call may be in flight; other
//! callers are rejected until it settles.

use crate::errors::BreakerError;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit (default: 5).
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit (default: 2).
    pub success_threshold: u32,
    /// Time since the last failure before an open circuit allows a trial
    /// (default: 30s).
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure.
    pub since_last_failure_ms: Option<u64>,
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    /// Moves an open circuit to half-open once the cooldown has elapsed.
    fn refresh(&mut self, timeout: Duration, name: &str) {
        if self.state != CircuitState::Open {
            return;
        }
        let cooled_down = self
            .last_failure
            .map_or(true, |at| at.elapsed() >= timeout);
        if cooled_down {
            info!("CIRCUIT | {name} half-open, allowing a trial call");
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
            self.trial_in_flight = false;
        }
    }
}

/// Circuit breaker owned by a single resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitBreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Runs `op` under the breaker.
    ///
    /// Returns [`BreakerError::Open`] without calling `op` while the circuit
    /// is open or a half-open trial is already in flight. Otherwise the
    /// outcome of `op` is recorded and passed through.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Returns whether the admitted call is the half-open trial.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.lock();
        inner.refresh(self.config.timeout, &self.name);
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(BreakerError::Open),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(BreakerError::Open),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!("CIRCUIT | {} closed after successful trials", self.name);
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            // Reset while the call was in flight.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "CIRCUIT | {} opened after {} consecutive failures",
                        self.name, inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("CIRCUIT | {} trial failed, reopening", self.name);
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.refresh(self.config.timeout, &self.name);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        inner.refresh(self.config.timeout, &self.name);
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            since_last_failure_ms: inner
                .last_failure
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Forces the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        *self.lock() = CircuitBreakerInner::new();
    }
}
