// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic HTTP log polling.
//!
//! Every poller is its own task holding its own seen set and circuit
//! breaker. A tick fetches the URL, parses the body and pushes only entries
//! whose dedup key has not been seen by that poller before.
//!
//! - The first tick fires immediately, later ones every `interval`.
//! - A failed fetch is logged and retried on the next natural tick.
//! - While the breaker is open, ticks are skipped without contacting the
//!   endpoint.
//! - Stopping a poller cancels its timer at once; a fetch in flight is
//!   abandoned and its result never reaches the pipeline.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::constants;
use crate::entry::LogEntry;
use crate::errors::{BreakerError, FetchError, IngestError};
use crate::parser::parse_body;
use crate::pipeline::PipelineHandle;
use crate::rate_limiter::RateLimiter;
use reqwest::Url;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPollerConfig {
    /// Floor applied to every requested interval.
    pub min_interval: Duration,
    pub request_timeout: Duration,
    /// Seen-set size above which the oldest half is discarded.
    pub max_seen_keys: usize,
    pub breaker: CircuitBreakerConfig,
}

impl Default for HttpPollerConfig {
    fn default() -> Self {
        Self {
            min_interval: constants::MIN_POLL_INTERVAL,
            request_timeout: constants::HTTP_REQUEST_TIMEOUT,
            max_seen_keys: constants::MAX_SEEN_KEYS,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PollerId(String);

impl PollerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PollerId {
    fn from(id: &str) -> Self {
        PollerId(id.to_string())
    }
}

/// Bounded record of dedup keys, oldest first.
#[derive(Debug)]
pub struct SeenSet {
    keys: HashSet<String>,
    order: VecDeque<String>,
    max: usize,
}

impl SeenSet {
    pub fn new(max: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            max: max.max(2),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `true` if `key` was not seen before.
    pub fn insert(&mut self, key: String) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.max {
            let trim = self.order.len() / 2;
            for old in self.order.drain(..trim) {
                self.keys.remove(&old);
            }
            debug!("HTTP | Seen set trimmed by {trim} keys");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-poller diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerDetails {
    pub id: PollerId,
    pub url: String,
    pub interval_ms: u64,
    pub ticks: u64,
    pub delivered: u64,
    pub skipped_ticks: u64,
    pub failures: u64,
    pub seen_keys: usize,
    pub circuit_state: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct PollerShared {
    id: PollerId,
    url: Url,
    source: String,
    interval: Duration,
    breaker: CircuitBreaker,
    ticks: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    seen_keys: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl PollerShared {
    #[allow(clippy::expect_used)]
    fn last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().expect("lock poisoned")
    }

    fn details(&self) -> PollerDetails {
        PollerDetails {
            id: self.id.clone(),
            url: self.source.clone(),
            interval_ms: u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            ticks: self.ticks.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped_ticks: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            seen_keys: self.seen_keys.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
            last_error: self.last_error().clone(),
        }
    }
}

struct PollerEntry {
    shared: Arc<PollerShared>,
    cancel: CancellationToken,
}

pub struct HttpPoller {
    config: HttpPollerConfig,
    client: reqwest::Client,
    pipeline: PipelineHandle,
    limiter: Option<Arc<RateLimiter>>,
    pollers: Mutex<HashMap<PollerId, PollerEntry>>,
    next_id: AtomicU64,
}

impl HttpPoller {
    pub fn new(
        config: HttpPollerConfig,
        pipeline: PipelineHandle,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(FetchError::from)?;
        Ok(Self {
            config,
            client,
            pipeline,
            limiter,
            pollers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    #[allow(clippy::expect_used)]
    fn pollers(&self) -> MutexGuard<'_, HashMap<PollerId, PollerEntry>> {
        self.pollers.lock().expect("lock poisoned")
    }

    /// Fetches and parses `url` once. Nothing is deduplicated or pushed.
    pub async fn load_once(&self, url: &str) -> Result<Vec<LogEntry>, IngestError> {
        let parsed = validate_url(url)?;
        let entries = fetch_entries(&self.client, &parsed, url.trim()).await?;
        debug!("HTTP | Loaded {} entries from {}", entries.len(), url.trim());
        Ok(entries)
    }

    /// Starts polling `url`. The interval is raised to the configured floor
    /// when shorter.
    pub fn start_poll(&self, url: &str, interval: Duration) -> Result<PollerId, IngestError> {
        let parsed = validate_url(url)?;
        let interval = interval.max(self.config.min_interval);
        let id = PollerId(format!(
            "poll-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1
        ));

        let shared = Arc::new(PollerShared {
            id: id.clone(),
            url: parsed,
            source: url.trim().to_string(),
            interval,
            breaker: CircuitBreaker::new(id.as_str(), self.config.breaker.clone()),
            ticks: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            seen_keys: AtomicUsize::new(0),
            last_error: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(run_poller(
            self.client.clone(),
            Arc::clone(&shared),
            self.pipeline.clone(),
            self.limiter.clone(),
            SeenSet::new(self.config.max_seen_keys),
            cancel.clone(),
        ));
        self.pollers()
            .insert(id.clone(), PollerEntry { shared, cancel });

        info!(
            "HTTP | Started {id} polling {} every {}ms",
            url.trim(),
            interval.as_millis()
        );
        Ok(id)
    }

    pub fn stop_poll(&self, id: &str) -> Result<(), IngestError> {
        let removed = self.pollers().remove(&PollerId::from(id));
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!("HTTP | Stopped {id}");
                Ok(())
            }
            None => Err(IngestError::PollerNotFound(id.to_string())),
        }
    }

    /// Stops every poller; returns how many were running.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<PollerEntry> = self.pollers().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!("HTTP | Stopped {} pollers", drained.len());
        }
        drained.len()
    }

    pub fn active_count(&self) -> usize {
        self.pollers().len()
    }

    /// Details of every active poller, in creation order.
    pub fn details(&self) -> Vec<PollerDetails> {
        let shared: Vec<Arc<PollerShared>> = self
            .pollers()
            .values()
            .map(|entry| Arc::clone(&entry.shared))
            .collect();
        let mut details: Vec<PollerDetails> = shared.iter().map(|s| s.details()).collect();
        details.sort_by_key(|d| poller_number(&d.id));
        details
    }
}

fn poller_number(id: &PollerId) -> u64 {
    id.as_str()
        .strip_prefix("poll-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

fn validate_url(url: &str) -> Result<Url, IngestError> {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed).map_err(|e| IngestError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(IngestError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

async fn fetch_entries(
    client: &reqwest::Client,
    url: &Url,
    source: &str,
) -> Result<Vec<LogEntry>, FetchError> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: source.to_string(),
        });
    }
    let body = response.text().await?;
    Ok(parse_body(source, &body))
}

async fn run_poller(
    client: reqwest::Client,
    shared: Arc<PollerShared>,
    pipeline: PipelineHandle,
    limiter: Option<Arc<RateLimiter>>,
    mut seen: SeenSet,
    cancel: CancellationToken,
) {
    let id = &shared.id;
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        shared.ticks.fetch_add(1, Ordering::Relaxed);

        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = shared
                .breaker
                .execute(|| fetch_entries(&client, &shared.url, &shared.source)) => outcome,
        };

        match outcome {
            Ok(entries) => {
                *shared.last_error() = None;
                let fresh = deduplicate(entries, &mut seen, limiter.as_deref());
                shared.seen_keys.store(seen.len(), Ordering::Relaxed);
                if fresh.is_empty() {
                    continue;
                }
                let count = fresh.len() as u64;
                if pipeline.push(fresh).is_err() {
                    debug!("HTTP | {id} pipeline closed, stopping");
                    break;
                }
                shared.delivered.fetch_add(count, Ordering::Relaxed);
                debug!("HTTP | {id} delivered {count} new entries");
            }
            Err(BreakerError::Open) => {
                shared.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("HTTP | {id} circuit open, skipping tick");
            }
            Err(BreakerError::Inner(err)) => {
                shared.failures.fetch_add(1, Ordering::Relaxed);
                warn!("HTTP | {id} fetch failed: {err}");
                *shared.last_error() = Some(err.to_string());
            }
        }
    }
    debug!("HTTP | {id} poll loop stopped");
}

/// Keeps entries not seen before, in source order. An entry refused by the
/// limiter is not marked seen, so a later tick can still deliver it.
fn deduplicate(
    entries: Vec<LogEntry>,
    seen: &mut SeenSet,
    limiter: Option<&RateLimiter>,
) -> Vec<LogEntry> {
    let mut fresh = Vec::new();
    for entry in entries {
        let key = entry.dedup_key();
        if seen.contains(&key) {
            continue;
        }
        if let Some(limiter) = limiter {
            if !limiter.try_consume(1) {
                continue;
            }
        }
        if seen.insert(key) {
            fresh.push(entry);
        }
    }
    fresh
}
