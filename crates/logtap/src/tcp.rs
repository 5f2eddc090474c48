// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited TCP log intake.
//!
//! Each accepted socket gets its own task owning a [`LineFramer`]. Complete
//! lines are parsed (structured or plain text), normalized and pushed to the
//! delivery pipeline in arrival order. Every connection is tracked in a
//! [`ConnectionRegistry`] from accept until close; stopping the ingestor
//! force-ends all of them and waits until the registry is empty.

use crate::constants;
use crate::entry::{LogEntry, LogLevel};
use crate::errors::IngestError;
use crate::parser::parse_line;
use crate::pipeline::PipelineHandle;
use crate::rate_limiter::RateLimiter;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the TCP ingestor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpIngestorConfig {
    /// Host to bind the listener to (e.g., "127.0.0.1")
    pub host: String,
    pub max_connections: usize,
    pub max_buffer_size: usize,
    pub max_line_length: usize,
    pub idle_timeout: Duration,
}

impl Default for TcpIngestorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            max_connections: constants::MAX_CONNECTIONS,
            max_buffer_size: constants::MAX_BUFFER_SIZE,
            max_line_length: constants::MAX_LINE_LENGTH,
            idle_timeout: constants::IDLE_TIMEOUT,
        }
    }
}

/// Splits a byte stream into lines under fixed memory bounds.
///
/// - `\n` terminates a line; a trailing `\r` is stripped.
/// - Blank lines are skipped.
/// - Lines longer than `max_line_length` bytes are dropped.
/// - Once the unterminated tail grows past `max_buffer_size`, only its
///   trailing half is kept.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_buffer_size: usize,
    max_line_length: usize,
    dropped_lines: u64,
    overflow_trims: u64,
}

impl LineFramer {
    pub fn new(max_buffer_size: usize, max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size: max_buffer_size.max(1),
            max_line_length,
            dropped_lines: 0,
            overflow_trims: 0,
        }
    }

    /// Feeds one chunk and returns the lines it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            if let Some(line) = self.accept_line(consumed, end) {
                lines.push(line);
            }
            consumed = end + 1;
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_buffer_size {
            let keep = (self.buffer.len() / 2).min(self.max_buffer_size);
            let cut = self.buffer.len() - keep;
            self.buffer.drain(..cut);
            self.overflow_trims += 1;
            warn!(
                "TCP | Unterminated input exceeded {} bytes, discarded {cut} bytes",
                self.max_buffer_size
            );
        }

        lines
    }

    /// Emits the unterminated tail, if any. Called on clean EOF.
    pub fn finish(&mut self) -> Option<String> {
        let end = self.buffer.len();
        let line = self.accept_line(0, end);
        self.buffer.clear();
        line
    }

    fn accept_line(&mut self, start: usize, end: usize) -> Option<String> {
        let mut raw = &self.buffer[start..end];
        if let [rest @ .., b'\r'] = raw {
            raw = rest;
        }
        if raw.len() > self.max_line_length {
            self.dropped_lines += 1;
            warn!(
                "TCP | Dropped line of {} bytes (limit {})",
                raw.len(),
                self.max_line_length
            );
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() {
            return None;
        }
        Some(line.into_owned())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    pub fn overflow_trims(&self) -> u64 {
        self.overflow_trims
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    peer: SocketAddr,
    last_activity: Instant,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

/// Active connections, keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    emptied: Notify,
}

impl ConnectionRegistry {
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Registers a connection unless `max` are already tracked.
    pub fn try_register(
        &self,
        peer: SocketAddr,
        cancel: CancellationToken,
        max: usize,
    ) -> Option<ConnectionId> {
        let mut inner = self.lock();
        if inner.connections.len() >= max {
            return None;
        }
        inner.next_id += 1;
        let id = ConnectionId(inner.next_id);
        inner.connections.insert(
            id,
            ConnectionRecord {
                peer,
                last_activity: Instant::now(),
                cancel,
            },
        );
        Some(id)
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(record) = self.lock().connections.get_mut(&id) {
            record.last_activity = Instant::now();
        }
    }

    /// Removes `id`. Returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let (removed, now_empty) = {
            let mut inner = self.lock();
            let removed = inner.connections.remove(&id).is_some();
            (removed, inner.connections.is_empty())
        };
        if removed && now_empty {
            self.emptied.notify_waiters();
        }
        removed
    }

    /// Signals every tracked connection to close.
    pub fn cancel_all(&self) {
        for record in self.lock().connections.values() {
            record.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.lock().connections.values().map(|r| r.peer).collect()
    }

    /// Time since the least recently active connection saw data.
    pub fn longest_idle(&self) -> Option<Duration> {
        self.lock()
            .connections
            .values()
            .map(|r| r.last_activity.elapsed())
            .max()
    }

    /// Resolves once no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Deregisters its connection when the connection task ends, however it ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[derive(Debug, Default)]
struct TcpCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    lines: AtomicU64,
    dropped_lines: AtomicU64,
    throttled_lines: AtomicU64,
    idle_timeouts: AtomicU64,
    socket_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub active_connections: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub lines: u64,
    pub dropped_lines: u64,
    pub throttled_lines: u64,
    pub idle_timeouts: u64,
    pub socket_errors: u64,
}

struct Shared {
    config: TcpIngestorConfig,
    pipeline: PipelineHandle,
    limiter: Option<Arc<RateLimiter>>,
    registry: Arc<ConnectionRegistry>,
    counters: TcpCounters,
}

struct RunningListener {
    port: u16,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

pub struct TcpIngestor {
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningListener>>,
}

impl TcpIngestor {
    #[must_use]
    pub fn new(
        config: TcpIngestorConfig,
        pipeline: PipelineHandle,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                pipeline,
                limiter,
                registry: Arc::new(ConnectionRegistry::default()),
                counters: TcpCounters::default(),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting. Port 0 picks an ephemeral
    /// port; the bound port is returned.
    pub async fn start(&self, port: u16) -> Result<u16, IngestError> {
        let mut running = self.running.lock().await;
        if let Some(listener) = running.as_ref() {
            return Err(IngestError::AlreadyRunning(listener.port));
        }

        let addr = format!("{}:{}", self.shared.config.host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| IngestError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| IngestError::Bind {
                addr: addr.clone(),
                source,
            })?
            .port();

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *running = Some(RunningListener {
            port,
            cancel,
            accept_task,
        });
        info!("TCP | Listening on {}:{port}", self.shared.config.host);
        Ok(port)
    }

    /// Closes the listener and every connection. Resolves once the
    /// connection registry is empty; returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(listener) = self.running.lock().await.take() else {
            return false;
        };
        listener.cancel.cancel();
        if let Err(err) = listener.accept_task.await {
            error!("TCP | Accept loop ended abnormally: {err}");
        }
        self.shared.registry.cancel_all();
        self.shared.registry.wait_empty().await;
        info!("TCP | Listener on port {} stopped", listener.port);
        true
    }

    pub async fn status(&self) -> TcpStatus {
        let port = self.running.lock().await.as_ref().map(|l| l.port);
        let counters = &self.shared.counters;
        TcpStatus {
            running: port.is_some(),
            port,
            active_connections: self.shared.registry.len(),
            accepted: counters.accepted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            lines: counters.lines.load(Ordering::Relaxed),
            dropped_lines: counters.dropped_lines.load(Ordering::Relaxed),
            throttled_lines: counters.throttled_lines.load(Ordering::Relaxed),
            idle_timeouts: counters.idle_timeouts.load(Ordering::Relaxed),
            socket_errors: counters.socket_errors.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => admit(&shared, stream, peer, &cancel),
                Err(err) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    error!("TCP | Accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("TCP | Accept loop stopped");
}

fn admit(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
    let source = source_id(peer);
    let conn_cancel = cancel.child_token();
    let max = shared.config.max_connections;
    match shared.registry.try_register(peer, conn_cancel.clone(), max) {
        Some(id) => {
            shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
            debug!("TCP | Accepted {id} from {peer}");
            let registration = Registration {
                registry: Arc::clone(&shared.registry),
                id,
            };
            tokio::spawn(handle_connection(
                Arc::clone(shared),
                stream,
                source,
                registration,
                conn_cancel,
            ));
        }
        None => {
            drop(stream);
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("TCP | Rejected {peer}: {max} connections already open");
            emit(
                shared,
                LogEntry::synthetic(
                    LogLevel::Warn,
                    format!("Connection rejected: limit of {max} concurrent connections reached"),
                    &source,
                ),
            );
        }
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    source: String,
    registration: Registration,
    cancel: CancellationToken,
) {
    let idle_timeout = shared.config.idle_timeout;
    let mut framer = LineFramer::new(shared.config.max_buffer_size, shared.config.max_line_length);
    let mut buf = vec![0u8; constants::READ_CHUNK_SIZE];
    let mut idle_deadline = Instant::now() + idle_timeout;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("TCP | Closing {source}: listener stopped");
                break;
            }
            () = tokio::time::sleep_until(idle_deadline) => {
                shared.counters.idle_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("TCP | Closing {source}: idle for {}s", idle_timeout.as_secs());
                emit(
                    &shared,
                    LogEntry::synthetic(
                        LogLevel::Error,
                        format!("Connection closed after {}s of inactivity", idle_timeout.as_secs()),
                        &source,
                    ),
                );
                break;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    if let Some(line) = framer.finish() {
                        forward(&shared, &source, vec![line]);
                    }
                    debug!("TCP | {source} closed by peer");
                    break;
                }
                Ok(n) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    shared.registry.touch(registration.id);
                    let dropped_before = framer.dropped_lines();
                    let lines = framer.push(&buf[..n]);
                    let dropped = framer.dropped_lines() - dropped_before;
                    if dropped > 0 {
                        shared.counters.dropped_lines.fetch_add(dropped, Ordering::Relaxed);
                    }
                    forward(&shared, &source, lines);
                }
                Err(err) => {
                    shared.counters.socket_errors.fetch_add(1, Ordering::Relaxed);
                    error!("TCP | Socket error on {source}: {err}");
                    emit(
                        &shared,
                        LogEntry::synthetic(LogLevel::Error, format!("Socket error: {err}"), &source),
                    );
                    break;
                }
            },
        }
    }
    drop(registration);
}

fn forward(shared: &Shared, source: &str, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(limiter) = &shared.limiter {
            if !limiter.try_consume(1) {
                shared.counters.throttled_lines.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }
        shared.counters.lines.fetch_add(1, Ordering::Relaxed);
        entries.push(parse_line(source, &line));
    }
    if shared.pipeline.push(entries).is_err() {
        debug!("TCP | Pipeline closed, dropping entries from {source}");
    }
}

fn emit(shared: &Shared, entry: LogEntry) {
    if shared.pipeline.push_one(entry).is_err() {
        debug!("TCP | Pipeline closed, dropping diagnostic entry");
    }
}

fn source_id(peer: SocketAddr) -> String {
    format!("tcp:{}:{}", peer.ip(), peer.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{next_pushed, PipelineCommand};
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_secs(5);

    fn ingestor(
        config: TcpIngestorConfig,
    ) -> (TcpIngestor, mpsc::UnboundedReceiver<PipelineCommand>) {
        let (pipeline, rx) = PipelineHandle::detached();
        (TcpIngestor::new(config, pipeline, None), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<PipelineCommand>) -> Vec<LogEntry> {
        timeout(WAIT, next_pushed(rx))
            .await
            .expect("timed out waiting for entries")
            .expect("pipeline channel closed")
    }

    #[test]
    fn test_framer_splits_lines_across_chunks() {
        let mut framer = LineFramer::new(1024, 1024);
        assert!(framer.push(b"hel").is_empty());
        assert_eq!(framer.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(framer.push(b"ld\n\n  \nlast"), vec!["world"]);
        assert_eq!(framer.finish(), Some("last".to_string()));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    #[traced_test]
    fn test_framer_drops_long_lines() {
        let mut framer = LineFramer::new(1024, 8);
        let lines = framer.push(b"short\nthis line is too long\nok\n");
        assert_eq!(lines, vec!["short", "ok"]);
        assert_eq!(framer.dropped_lines(), 1);
        assert!(logs_contain("Dropped line of 21 bytes"));
    }

    #[test]
    fn test_framer_trims_overflow_to_trailing_half() {
        let mut framer = LineFramer::new(100, 1_000);
        framer.push(&[b'a'; 60]);
        framer.push(&[b'b'; 60]);
        assert_eq!(framer.buffered(), 60);
        assert_eq!(framer.overflow_trims(), 1);
        // The kept tail is the newest data.
        let line = framer.finish().unwrap();
        assert!(line.bytes().all(|b| b == b'b'));
    }

    proptest! {
        #[test]
        fn test_framer_preserves_lines(
            lines in proptest::collection::vec("[a-zA-Z0-9 {}:\",]{0,40}", 0..30),
            cuts in proptest::collection::vec(1usize..64, 1..40),
        ) {
            let mut input = Vec::new();
            for line in &lines {
                input.extend_from_slice(line.as_bytes());
                input.push(b'\n');
            }
            let mut framer = LineFramer::new(4096, 4096);
            let mut output = Vec::new();
            let mut rest = input.as_slice();
            let mut cut = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = (*cut.next().unwrap()).min(rest.len());
                output.extend(framer.push(&rest[..n]));
                rest = &rest[n..];
            }
            let expected: Vec<String> = lines
                .into_iter()
                .filter(|line| !line.trim().is_empty())
                .collect();
            prop_assert_eq!(output, expected);
        }

        #[test]
        fn test_framer_buffer_is_bounded(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..50),
        ) {
            let mut framer = LineFramer::new(256, 64);
            for chunk in chunks {
                framer.push(&chunk);
                prop_assert!(framer.buffered() <= 256);
            }
        }
    }

    #[tokio::test]
    async fn test_registry_remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let id = registry
            .try_register(peer, CancellationToken::new(), 10)
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
        timeout(WAIT, registry.wait_empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_enforces_ceiling() {
        let registry = ConnectionRegistry::default();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(registry.try_register(peer, CancellationToken::new(), 1).is_some());
        assert!(registry.try_register(peer, CancellationToken::new(), 1).is_none());
    }

    #[tokio::test]
    async fn test_json_line_is_ingested() {
        let (ingestor, mut rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();
        assert_ne!(port, 0);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"{\"level\":\"error\",\"message\":\"boom\"}\nplain WARN text\n")
            .await
            .unwrap();

        let mut entries = recv(&mut rx).await;
        if entries.len() < 2 {
            entries.extend(recv(&mut rx).await);
        }
        assert_eq!(entries[0].message, "boom");
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[1].message, "plain WARN text");
        assert_eq!(entries[1].level, LogLevel::Warn);
        let local = client.local_addr().unwrap();
        assert_eq!(entries[0].source, format!("tcp:127.0.0.1:{}", local.port()));

        assert!(ingestor.stop().await);
    }

    #[tokio::test]
    async fn test_array_lines_yield_one_entry_each() {
        let (ingestor, mut rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"[]\n[1,2]\nlast\n").await.unwrap();

        let mut entries = Vec::new();
        while entries.len() < 3 {
            entries.extend(recv(&mut rx).await);
        }
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["[]", "[1,2]", "last"]);
        assert_eq!(ingestor.status().await.lines, 3);
        ingestor.stop().await;
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_reset_connection_reports_socket_error() {
        let (ingestor, mut rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();

        let mut sibling = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sibling.write_all(b"sibling one\n").await.unwrap();
        assert_eq!(recv(&mut rx).await[0].message, "sibling one");

        let mut reset = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        reset.write_all(b"before reset\n").await.unwrap();
        assert_eq!(recv(&mut rx).await[0].message, "before reset");
        reset.set_linger(Some(Duration::ZERO)).unwrap();
        drop(reset);

        let entries = recv(&mut rx).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert!(entries[0].message.starts_with("Socket error"));
        timeout(WAIT, async {
            while ingestor.registry().len() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let status = ingestor.status().await;
        assert!(status.running);
        assert_eq!(status.socket_errors, 1);

        sibling.write_all(b"sibling two\n").await.unwrap();
        assert_eq!(recv(&mut rx).await[0].message, "sibling two");

        drop(sibling);
        timeout(WAIT, ingestor.registry().wait_empty()).await.unwrap();
        assert_eq!(ingestor.registry().len(), 0);
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_trailing_data_emitted_on_close() {
        let (ingestor, mut rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"no newline").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let entries = recv(&mut rx).await;
        assert_eq!(entries[0].message, "no newline");
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (ingestor, _rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();
        assert!(matches!(
            ingestor.start(0).await,
            Err(IngestError::AlreadyRunning(p)) if p == port
        ));
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported_and_retry_works() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let (ingestor, _rx) = ingestor(TcpIngestorConfig::default());
        assert!(matches!(
            ingestor.start(taken).await,
            Err(IngestError::Bind { .. })
        ));
        assert!(!ingestor.status().await.running);

        drop(blocker);
        assert!(ingestor.start(0).await.is_ok());
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_connections_beyond_ceiling_are_rejected() {
        let config = TcpIngestorConfig {
            max_connections: 1,
            ..TcpIngestorConfig::default()
        };
        let (ingestor, mut rx) = ingestor(config);
        let port = ingestor.start(0).await.unwrap();

        let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        timeout(WAIT, async {
            while ingestor.registry().len() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let entries = recv(&mut rx).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert!(entries[0].message.contains("limit of 1"));

        let mut buf = [0u8; 8];
        let read = timeout(WAIT, second.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(ingestor.status().await.rejected, 1);
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let config = TcpIngestorConfig {
            idle_timeout: Duration::from_millis(100),
            ..TcpIngestorConfig::default()
        };
        let (ingestor, mut rx) = ingestor(config);
        let port = ingestor.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let entries = recv(&mut rx).await;
        assert_eq!(entries[0].level, LogLevel::Error);
        assert!(entries[0].message.contains("inactivity"));

        let mut buf = [0u8; 8];
        let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        timeout(WAIT, ingestor.registry().wait_empty()).await.unwrap();
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_force_ends_connections() {
        let (ingestor, _rx) = ingestor(TcpIngestorConfig::default());
        let port = ingestor.start(0).await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }
        timeout(WAIT, async {
            while ingestor.registry().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(timeout(WAIT, ingestor.stop()).await.unwrap());
        let status = ingestor.status().await;
        assert!(!status.running);
        assert_eq!(status.active_connections, 0);

        for client in &mut clients {
            let mut buf = [0u8; 8];
            let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }
        assert!(!ingestor.stop().await);
    }

    #[tokio::test]
    async fn test_rate_limited_lines_are_dropped() {
        use crate::rate_limiter::RateLimiterConfig;

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            max_tokens: 2,
            tokens_per_interval: 1,
            interval: Duration::from_secs(3_600),
        }));
        let (pipeline, mut rx) = PipelineHandle::detached();
        let ingestor = TcpIngestor::new(
            TcpIngestorConfig::default(),
            pipeline,
            Some(Arc::clone(&limiter)),
        );
        let port = ingestor.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"a\nb\nc\nd\n").await.unwrap();

        let mut messages = Vec::new();
        timeout(WAIT, async {
            while ingestor.status().await.lines + ingestor.status().await.throttled_lines < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        while let Ok(command) = rx.try_recv() {
            if let PipelineCommand::Push(entries) = command {
                messages.extend(entries.into_iter().map(|e| e.message));
            }
        }
        assert_eq!(messages, vec!["a", "b"]);
        assert_eq!(limiter.throttled_count(), 2);
        assert_eq!(ingestor.status().await.throttled_lines, 2);
        ingestor.stop().await;
    }
}
