// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, adaptively paced delivery toward the presentation sink.
//!
//! Producers push through a cloneable [`PipelineHandle`]; the push is a plain
//! channel send and never waits. The [`PipelineService`] actor owns the buffer
//! and hands fixed-size batches to the [`EntrySink`], spacing them by a delay
//! that follows how long the sink takes:
//!
//! ```text
//!   push ──> DeliveryBuffer (FIFO, capped) ──batch──> EntrySink
//!                                             └─────> FileWriterHandle (JSON lines)
//! ```
//!
//! # Overflow
//!
//! The buffer holds at most `capacity` entries. Arrivals beyond it displace
//! the oldest buffered entries, so under sustained overload the pipeline keeps
//! the most recent data. Drops are counted and a warning is logged at most
//! once per `drop_warning_interval`.
//!
//! # Pacing
//!
//! [`AdaptiveDelay`] keeps the last `history_len` processing times. A rolling
//! average above `slow_threshold` doubles the delay; a window where every
//! sample is under `fast_threshold` shrinks it by a quarter. The delay always
//! stays within `[min_delay, max_delay]`.

use crate::constants;
use crate::entry::{EntrySink, LogEntry};
use crate::errors::IngestError;
use crate::file_writer::FileWriterHandle;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub initial_delay: Duration,
    pub slow_threshold: Duration,
    pub fast_threshold: Duration,
    pub history_len: usize,
    pub drop_warning_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: constants::PIPELINE_CAPACITY,
            batch_size: constants::BATCH_SIZE,
            min_delay: constants::MIN_DELAY,
            max_delay: constants::MAX_DELAY,
            initial_delay: constants::INITIAL_DELAY,
            slow_threshold: constants::SLOW_PROCESSING_THRESHOLD,
            fast_threshold: constants::FAST_PROCESSING_THRESHOLD,
            history_len: constants::PROCESSING_HISTORY_LEN,
            drop_warning_interval: constants::DROP_WARNING_INTERVAL,
        }
    }
}

/// Batch delay driven by a rolling window of processing times.
#[derive(Debug, Clone)]
pub struct AdaptiveDelay {
    current: Duration,
    history: VecDeque<Duration>,
    history_len: usize,
    min: Duration,
    max: Duration,
    slow: Duration,
    fast: Duration,
}

impl AdaptiveDelay {
    pub fn new(config: &PipelineConfig) -> Self {
        // A zero floor would let the delivery loop spin.
        let min = config.min_delay.max(Duration::from_millis(1));
        let max = config.max_delay.max(min);
        Self {
            current: config.initial_delay.clamp(min, max),
            history: VecDeque::with_capacity(config.history_len),
            history_len: config.history_len.max(1),
            min,
            max,
            slow: config.slow_threshold,
            fast: config.fast_threshold,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Records one batch's processing time and returns the new delay.
    pub fn record(&mut self, processing: Duration) -> Duration {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(processing);

        let total: Duration = self.history.iter().sum();
        let average = total / self.history.len() as u32;
        if average > self.slow {
            self.current = self.current.saturating_mul(2).min(self.max);
        } else if self.history.iter().all(|sample| *sample < self.fast) {
            self.current = self.current.saturating_sub(self.current / 4).max(self.min);
        }
        self.current
    }
}

/// FIFO buffer that evicts its oldest entries once full.
#[derive(Debug)]
pub struct DeliveryBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
    drop_warnings: u64,
    last_warning: Option<Instant>,
    warning_interval: Duration,
}

impl DeliveryBuffer {
    pub fn new(capacity: usize, warning_interval: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
            drop_warnings: 0,
            last_warning: None,
            warning_interval,
        }
    }

    /// Appends `incoming`, evicting the oldest entries beyond capacity.
    /// Returns how many entries were dropped by this call.
    pub fn push(&mut self, incoming: Vec<LogEntry>) -> usize {
        // Arrivals that would be evicted by later arrivals of the same push
        // are skipped outright.
        let skipped = incoming.len().saturating_sub(self.capacity);
        let kept = incoming.len() - skipped;
        let evicted = (self.entries.len() + kept).saturating_sub(self.capacity);
        self.entries.drain(..evicted);
        self.entries.extend(incoming.into_iter().skip(skipped));

        let dropped = skipped + evicted;
        if dropped > 0 {
            self.dropped += dropped as u64;
            self.warn_dropped();
        }
        dropped
    }

    fn warn_dropped(&mut self) {
        let now = Instant::now();
        let due = self
            .last_warning
            .map_or(true, |at| now.duration_since(at) >= self.warning_interval);
        if due {
            warn!(
                "PIPELINE | Buffer full at {} entries, dropping oldest ({} dropped so far)",
                self.capacity, self.dropped
            );
            self.drop_warnings += 1;
            self.last_warning = Some(now);
        }
    }

    /// Removes up to `max` entries from the front.
    pub fn take(&mut self, max: usize) -> Vec<LogEntry> {
        let n = max.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    pub fn take_all(&mut self) -> Vec<LogEntry> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn drop_warnings(&self) -> u64 {
        self.drop_warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub buffered: usize,
    pub capacity: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub drop_warnings: u64,
    pub batches: u64,
    pub current_delay_ms: u64,
}

#[derive(Debug)]
pub enum PipelineCommand {
    Push(Vec<LogEntry>),
    /// Delivers everything buffered; replies with the number delivered.
    Flush(oneshot::Sender<usize>),
    Stats(oneshot::Sender<PipelineStats>),
    /// Flushes, then stops the service.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineHandle {
    /// Hands entries to the pipeline without waiting.
    pub fn push(&self, entries: Vec<LogEntry>) -> Result<(), IngestError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.tx
            .send(PipelineCommand::Push(entries))
            .map_err(|_| IngestError::PipelineClosed)
    }

    pub fn push_one(&self, entry: LogEntry) -> Result<(), IngestError> {
        self.push(vec![entry])
    }

    pub async fn flush(&self) -> Result<usize, IngestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Flush(reply))
            .map_err(|_| IngestError::PipelineClosed)?;
        rx.await.map_err(|_| IngestError::PipelineClosed)
    }

    pub async fn stats(&self) -> Result<PipelineStats, IngestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Stats(reply))
            .map_err(|_| IngestError::PipelineClosed)?;
        rx.await.map_err(|_| IngestError::PipelineClosed)
    }

    pub async fn shutdown(&self) -> Result<(), IngestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Shutdown(reply))
            .map_err(|_| IngestError::PipelineClosed)?;
        rx.await.map_err(|_| IngestError::PipelineClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle whose commands land on a bare receiver instead of a service.
    #[cfg(test)]
    pub(crate) fn detached() -> (PipelineHandle, mpsc::UnboundedReceiver<PipelineCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PipelineHandle { tx }, rx)
    }
}

/// Collects pushed entries from a detached handle's receiver.
#[cfg(test)]
pub(crate) async fn next_pushed(
    rx: &mut mpsc::UnboundedReceiver<PipelineCommand>,
) -> Option<Vec<LogEntry>> {
    loop {
        match rx.recv().await? {
            PipelineCommand::Push(entries) => return Some(entries),
            _ => continue,
        }
    }
}

pub struct PipelineService {
    buffer: DeliveryBuffer,
    delay: AdaptiveDelay,
    batch_size: usize,
    sink: Arc<dyn EntrySink>,
    writer: Option<FileWriterHandle>,
    next_delivery: Option<Instant>,
    delivered: u64,
    batches: u64,
    rx: mpsc::UnboundedReceiver<PipelineCommand>,
}

impl PipelineService {
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        sink: Arc<dyn EntrySink>,
        writer: Option<FileWriterHandle>,
    ) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            buffer: DeliveryBuffer::new(config.capacity, config.drop_warning_interval),
            delay: AdaptiveDelay::new(config),
            batch_size: config.batch_size.max(1),
            sink,
            writer,
            next_delivery: None,
            delivered: 0,
            batches: 0,
            rx,
        };
        (service, PipelineHandle { tx })
    }

    /// Runs until a shutdown command arrives or every handle is dropped.
    /// Both paths deliver whatever is still buffered first.
    pub async fn run(mut self) {
        debug!("PIPELINE | Delivery pipeline started");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(PipelineCommand::Push(entries)) => {
                        self.buffer.push(entries);
                        self.schedule();
                    }
                    Some(PipelineCommand::Flush(reply)) => {
                        let delivered = self.flush_all();
                        let _ = reply.send(delivered);
                    }
                    Some(PipelineCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(PipelineCommand::Shutdown(reply)) => {
                        self.flush_all();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.flush_all();
                        break;
                    }
                },
                () = wait_until(self.next_delivery) => {
                    self.next_delivery = None;
                    self.deliver_batch();
                }
            }
        }

        debug!("PIPELINE | Delivery pipeline stopped");
    }

    fn schedule(&mut self) {
        if self.next_delivery.is_none() && !self.buffer.is_empty() {
            self.next_delivery = Some(Instant::now() + self.delay.current());
        }
    }

    fn deliver_batch(&mut self) {
        if !self.sink.is_ready() {
            debug!(
                "PIPELINE | Sink not ready, holding {} entries",
                self.buffer.len()
            );
            self.schedule();
            return;
        }

        let batch = self.buffer.take(self.batch_size);
        if batch.is_empty() {
            return;
        }
        let started = Instant::now();
        self.hand_off(batch);
        let delay = self.delay.record(started.elapsed());
        debug!("PIPELINE | Next batch in {}ms", delay.as_millis());
        self.schedule();
    }

    fn flush_all(&mut self) -> usize {
        self.next_delivery = None;
        let mut delivered = 0;
        while !self.buffer.is_empty() {
            let batch = self.buffer.take(self.batch_size);
            delivered += batch.len();
            self.hand_off(batch);
        }
        if delivered > 0 {
            debug!("PIPELINE | Flushed {delivered} entries");
        }
        delivered
    }

    fn hand_off(&mut self, batch: Vec<LogEntry>) {
        if let Some(writer) = &self.writer {
            for entry in &batch {
                match serde_json::to_vec(entry) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        // Failures are logged by the writer itself.
                        drop(writer.write(line));
                    }
                    Err(err) => error!("PIPELINE | Failed to serialize entry: {err}"),
                }
            }
        }
        self.delivered += batch.len() as u64;
        self.batches += 1;
        self.sink.deliver(batch);
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity,
            delivered: self.delivered,
            dropped: self.buffer.dropped(),
            drop_warnings: self.buffer.drop_warnings(),
            batches: self.batches,
            current_delay_ms: u64::try_from(self.delay.current().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
