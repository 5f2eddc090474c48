// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only output that never blocks ingestion.
//!
//! The writer is an actor: [`FileWriterService`] owns the target and a FIFO
//! queue of pending payloads, [`FileWriterHandle`] is the cloneable front end.
//! Exactly one write is in flight at a time. Each write settles its own
//! [`WriteCompletion`]; a failed write does not stop the queue.
//!
//! ```text
//!   handles ──commands──> service ──append (one at a time)──> target
//!                           │
//!                           └─ VecDeque<PendingWrite>
//! ```

use crate::errors::WriteError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Destination the writer appends payloads to.
#[async_trait]
pub trait AppendTarget: Send + 'static {
    async fn append(&mut self, payload: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl AppendTarget for tokio::fs::File {
    async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_all(payload).await?;
        self.flush().await
    }
}

type Reply = oneshot::Sender<Result<(), WriteError>>;
type InFlight<T> = Pin<Box<dyn Future<Output = (T, Reply, io::Result<()>)> + Send>>;

struct PendingWrite {
    payload: Vec<u8>,
    reply: Reply,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub queued: usize,
    pub in_flight: usize,
    pub written: u64,
    pub failed: u64,
    pub cleared: u64,
}

#[derive(Debug)]
pub enum WriterCommand {
    Write(Vec<u8>, Reply),
    /// Replies once the queue is empty and nothing is in flight.
    Flush(oneshot::Sender<()>),
    /// Fails every queued write; replies with how many were discarded.
    ClearQueue(oneshot::Sender<usize>),
    Stats(oneshot::Sender<WriterStats>),
    /// Drains the queue, then stops the service.
    Shutdown(oneshot::Sender<()>),
}

/// Completion handle for one enqueued write.
#[derive(Debug)]
pub struct WriteCompletion {
    rx: oneshot::Receiver<Result<(), WriteError>>,
}

impl WriteCompletion {
    /// Resolves once the payload is appended, failed, or discarded.
    pub async fn wait(self) -> Result<(), WriteError> {
        self.rx.await.unwrap_or(Err(WriteError::Closed))
    }
}

#[derive(Clone, Debug)]
pub struct FileWriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl FileWriterHandle {
    /// Enqueues `payload`. Never waits on the target.
    pub fn write(&self, payload: impl Into<Vec<u8>>) -> WriteCompletion {
        let (reply, rx) = oneshot::channel();
        // On a closed service the reply is dropped and `wait` reports Closed.
        let _ = self.tx.send(WriterCommand::Write(payload.into(), reply));
        WriteCompletion { rx }
    }

    pub async fn flush(&self) -> Result<(), WriteError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(reply))
            .map_err(|_| WriteError::Closed)?;
        rx.await.map_err(|_| WriteError::Closed)
    }

    pub async fn clear_queue(&self) -> Result<usize, WriteError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::ClearQueue(reply))
            .map_err(|_| WriteError::Closed)?;
        rx.await.map_err(|_| WriteError::Closed)
    }

    pub async fn stats(&self) -> Result<WriterStats, WriteError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Stats(reply))
            .map_err(|_| WriteError::Closed)?;
        rx.await.map_err(|_| WriteError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), WriteError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Shutdown(reply))
            .map_err(|_| WriteError::Closed)?;
        rx.await.map_err(|_| WriteError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct FileWriterService<T: AppendTarget> {
    /// `None` while a write holds the target.
    target: Option<T>,
    in_flight: Option<InFlight<T>>,
    queue: VecDeque<PendingWrite>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    shutdown_reply: Option<oneshot::Sender<()>>,
    closing: bool,
    stats: WriterStats,
    rx: mpsc::UnboundedReceiver<WriterCommand>,
}

impl FileWriterService<tokio::fs::File> {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(
        path: impl AsRef<Path>,
    ) -> io::Result<(FileWriterService<tokio::fs::File>, FileWriterHandle)> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        debug!("WRITER | Appending to {}", path.as_ref().display());
        Ok(Self::new(file))
    }
}

impl<T: AppendTarget> FileWriterService<T> {
    #[must_use]
    pub fn new(target: T) -> (Self, FileWriterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            target: Some(target),
            in_flight: None,
            queue: VecDeque::new(),
            flush_waiters: Vec::new(),
            shutdown_reply: None,
            closing: false,
            stats: WriterStats::default(),
            rx,
        };
        (service, FileWriterHandle { tx })
    }

    /// Processes commands and writes until shut down, or until every handle
    /// is dropped and the queue has drained.
    pub async fn run(mut self) {
        debug!("WRITER | File writer service started");

        loop {
            self.dispatch_next();
            if self.is_idle() {
                for waiter in self.flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if self.closing {
                    break;
                }
            }

            tokio::select! {
                (target, reply, result) = wait_in_flight(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.complete(target, reply, result);
                }
                command = self.rx.recv(), if !self.closing => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("WRITER | All handles dropped, draining queue");
                        self.closing = true;
                    }
                },
            }
        }

        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        debug!("WRITER | File writer service stopped");
    }

    fn handle(&mut self, command: WriterCommand) {
        match command {
            WriterCommand::Write(payload, reply) => {
                self.queue.push_back(PendingWrite { payload, reply });
            }
            WriterCommand::Flush(reply) => self.flush_waiters.push(reply),
            WriterCommand::ClearQueue(reply) => {
                let cleared = self.queue.len();
                for pending in self.queue.drain(..) {
                    let _ = pending.reply.send(Err(WriteError::QueueCleared));
                }
                self.stats.cleared += cleared as u64;
                if cleared > 0 {
                    warn!("WRITER | Discarded {cleared} queued writes");
                }
                let _ = reply.send(cleared);
            }
            WriterCommand::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            WriterCommand::Shutdown(reply) => {
                debug!("WRITER | Shutdown requested, draining queue");
                self.shutdown_reply = Some(reply);
                self.closing = true;
            }
        }
    }

    fn dispatch_next(&mut self) {
        if self.in_flight.is_some() || self.queue.is_empty() {
            return;
        }
        let Some(mut target) = self.target.take() else {
            return;
        };
        let Some(PendingWrite { payload, reply }) = self.queue.pop_front() else {
            self.target = Some(target);
            return;
        };
        self.in_flight = Some(Box::pin(async move {
            let result = target.append(&payload).await;
            (target, reply, result)
        }));
    }

    fn complete(&mut self, target: T, reply: Reply, result: io::Result<()>) {
        self.target = Some(target);
        match result {
            Ok(()) => {
                self.stats.written += 1;
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                self.stats.failed += 1;
                error!("WRITER | Write failed: {err}");
                let _ = reply.send(Err(WriteError::Io(err)));
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    fn snapshot(&self) -> WriterStats {
        WriterStats {
            queued: self.queue.len(),
            in_flight: usize::from(self.in_flight.is_some()),
            ..self.stats
        }
    }
}

async fn wait_in_flight<T>(in_flight: &mut Option<InFlight<T>>) -> (T, Reply, io::Result<()>) {
    match in_flight {
        Some(write) => write.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Records payloads; fails the calls whose index is in `fail_on`, and
    /// waits for a permit first when gated.
    struct RecordingTarget {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_on: HashSet<usize>,
        calls: usize,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl AppendTarget for RecordingTarget {
        async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn spawn_writer(
        fail_on: &[usize],
        gate: Option<Arc<Semaphore>>,
    ) -> (FileWriterHandle, Arc<Mutex<Vec<Vec<u8>>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let target = RecordingTarget {
            written: Arc::clone(&written),
            fail_on: fail_on.iter().copied().collect(),
            calls: 0,
            gate,
        };
        let (service, handle) = FileWriterService::new(target);
        tokio::spawn(service.run());
        (handle, written)
    }

    async fn wait_for_in_flight(handle: &FileWriterHandle) {
        for _ in 0..100 {
            if handle.stats().await.unwrap().in_flight == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("write never started");
    }

    #[tokio::test]
    async fn test_writes_in_fifo_order() {
        let (handle, written) = spawn_writer(&[], None);
        let completions: Vec<_> = (0..5).map(|i| handle.write(format!("{i}\n"))).collect();
        for completion in completions {
            completion.wait().await.unwrap();
        }
        let written = written.lock().unwrap().clone();
        let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("{i}\n").into_bytes()).collect();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_failure_only_fails_its_own_write() {
        let (handle, written) = spawn_writer(&[1], None);
        let first = handle.write("a");
        let second = handle.write("b");
        let third = handle.write("c");

        assert!(first.wait().await.is_ok());
        assert!(matches!(second.wait().await, Err(WriteError::Io(_))));
        assert!(third.wait().await.is_ok());

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.written, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_queue_spares_in_flight_write() {
        let gate = Arc::new(Semaphore::new(0));
        let (handle, written) = spawn_writer(&[], Some(Arc::clone(&gate)));
        let first = handle.write("a");
        wait_for_in_flight(&handle).await;
        let second = handle.write("b");
        let third = handle.write("c");

        assert_eq!(handle.clear_queue().await.unwrap(), 2);
        assert!(matches!(second.wait().await, Err(WriteError::QueueCleared)));
        assert!(matches!(third.wait().await, Err(WriteError::QueueCleared)));

        gate.add_permits(1);
        assert!(first.wait().await.is_ok());
        assert_eq!(written.lock().unwrap().as_slice(), &[b"a".to_vec()]);
        assert_eq!(handle.stats().await.unwrap().cleared, 2);
    }

    #[tokio::test]
    async fn test_flush_waits_for_queue() {
        let gate = Arc::new(Semaphore::new(0));
        let (handle, written) = spawn_writer(&[], Some(Arc::clone(&gate)));
        for payload in ["a", "b", "c"] {
            let _ = handle.write(payload);
        }
        wait_for_in_flight(&handle).await;

        let flusher = handle.clone();
        let flush = tokio::spawn(async move { flusher.flush().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!flush.is_finished());

        gate.add_permits(3);
        flush.await.unwrap().unwrap();
        assert_eq!(written.lock().unwrap().len(), 3);
        let stats = handle.stats().await.unwrap();
        assert_eq!((stats.queued, stats.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let (handle, written) = spawn_writer(&[], None);
        let completion = handle.write("last");
        handle.shutdown().await.unwrap();
        assert!(completion.wait().await.is_ok());
        assert_eq!(written.lock().unwrap().len(), 1);

        let after = handle.write("late");
        assert!(matches!(after.wait().await, Err(WriteError::Closed)));
    }

    #[tokio::test]
    async fn test_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let (service, handle) = FileWriterService::open(&path).await.unwrap();
        tokio::spawn(service.run());

        handle.write("one\n").wait().await.unwrap();
        handle.write("two\n").wait().await.unwrap();
        handle.shutdown().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }
}
