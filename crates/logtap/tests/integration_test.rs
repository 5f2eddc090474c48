// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use logtap::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    config::IngestConfig,
    health::HealthStatus,
    http_poller::HttpPollerConfig,
    service::IngestService,
    shutdown::ShutdownOutcome,
    EntrySink, LogEntry, LogLevel,
};
use mockito::Server;
use std::sync::{Arc, Mutex};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::{sleep, timeout, Duration},
};

const WAIT: Duration = Duration::from_secs(5);

const BODY: &str = r#"[
    {"timestamp":"2024-05-01T12:00:00Z","level":"info","message":"one"},
    {"timestamp":"2024-05-01T12:00:01Z","level":"warn","message":"two"},
    {"timestamp":"2024-05-01T12:00:02Z","level":"error","message":"three"}
]"#;

type Collected = Arc<Mutex<Vec<LogEntry>>>;

fn collecting_sink() -> (Arc<dyn EntrySink>, Collected) {
    let seen: Collected = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&seen);
    let sink = move |entries: Vec<LogEntry>| inner.lock().unwrap().extend(entries);
    (Arc::new(sink), seen)
}

fn fast_polling() -> IngestConfig {
    IngestConfig {
        poller: HttpPollerConfig {
            min_interval: Duration::from_millis(10),
            ..HttpPollerConfig::default()
        },
        ..IngestConfig::default()
    }
}

async fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

async fn wait_for_ticks(service: &IngestService, ticks: u64) {
    timeout(WAIT, async {
        loop {
            let diagnostics = service.diagnostics().await;
            if diagnostics
                .http
                .poller_details
                .first()
                .is_some_and(|d| d.ticks >= ticks)
            {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("poller did not tick");
}

#[cfg(test)]
#[tokio::test]
async fn tcp_json_line_reaches_sink() {
    let (sink, seen) = collecting_sink();
    let service = IngestService::start(&IngestConfig::default(), sink)
        .await
        .expect("failed to start service");
    let started = service.start_tcp(0).await;
    assert!(started.ok, "{}", started.message);
    let port = started.port.expect("no port");

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("unable to connect");
    stream
        .write_all(b"{\"timestamp\":\"2024-05-01T12:00:00Z\",\"level\":\"error\",\"message\":\"disk full\",\"logger\":\"storage\"}\n")
        .await
        .expect("unable to write");

    wait_for("tcp entry", || !seen.lock().unwrap().is_empty()).await;
    let entries = seen.lock().unwrap().clone();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, LogLevel::Error);
    assert_eq!(entries[0].message, "disk full");
    assert_eq!(entries[0].logger.as_deref(), Some("storage"));
    assert!(entries[0].source.starts_with("tcp:127.0.0.1:"));

    assert_eq!(service.tcp_status().await.active_connections, 1);
    drop(stream);
    service.shutdown().await;
}

#[cfg(test)]
#[tokio::test]
async fn repeated_polls_of_same_body_deliver_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/logs")
        .with_status(200)
        .with_body(BODY)
        .expect_at_least(5)
        .create_async()
        .await;
    let url = format!("{}/logs", server.url());

    let (sink, seen) = collecting_sink();
    let service = IngestService::start(&fast_polling(), sink)
        .await
        .expect("failed to start service");

    let loaded = service.http_load_once(&url).await;
    assert!(loaded.ok);
    assert_eq!(loaded.entries.as_ref().map(Vec::len), Some(3));

    let started = service.http_start_poll(&url, 10);
    assert!(started.ok);
    wait_for_ticks(&service, 5).await;
    service.pipeline().flush().await.expect("pipeline closed");

    let messages: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(messages, vec!["one", "two", "three"]);

    let stopped = service.http_stop_poll(started.id.as_deref().expect("no id"));
    assert!(stopped.ok);
    mock.assert_async().await;
    service.shutdown().await;
}

#[cfg(test)]
#[tokio::test]
async fn failing_endpoint_opens_circuit() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/logs")
        .with_status(500)
        .create_async()
        .await;
    let url = format!("{}/logs", server.url());

    let mut config = fast_polling();
    config.poller.breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        timeout: Duration::from_secs(60),
    };
    let (sink, _seen) = collecting_sink();
    let service = IngestService::start(&config, sink)
        .await
        .expect("failed to start service");

    assert!(service.http_start_poll(&url, 10).ok);
    wait_for_ticks(&service, 4).await;

    let diagnostics = service.diagnostics().await;
    let details = &diagnostics.http.poller_details[0];
    assert_eq!(details.circuit_state, CircuitState::Open);
    assert!(details.last_error.is_some());

    let report = service.health().run_checks().await;
    assert_eq!(
        report.check("pollers").map(|c| c.status),
        Some(HealthStatus::Unhealthy)
    );
    service.shutdown().await;
}

#[cfg(test)]
#[tokio::test]
async fn delivered_entries_are_appended_to_output_file() {
    let dir = tempfile::tempdir().expect("unable to create temp dir");
    let path = dir.path().join("entries.jsonl");
    let config = IngestConfig {
        output_file: Some(path.clone()),
        ..IngestConfig::default()
    };
    let (sink, seen) = collecting_sink();
    let service = IngestService::start(&config, sink)
        .await
        .expect("failed to start service");
    let port = service.start_tcp(0).await.port.expect("no port");

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("unable to connect");
    stream
        .write_all(b"first plain line\nERROR second plain line\n")
        .await
        .expect("unable to write");
    wait_for("two entries", || seen.lock().unwrap().len() == 2).await;
    drop(stream);

    assert_eq!(
        service.shutdown().await,
        ShutdownOutcome::Completed { failed: vec![] }
    );

    let contents = tokio::fs::read_to_string(&path)
        .await
        .expect("unable to read output");
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("invalid json line"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["message"], "first plain line");
    assert_eq!(lines[0]["level"], "INFO");
    assert_eq!(lines[1]["message"], "ERROR second plain line");
    assert_eq!(lines[1]["level"], "ERROR");
}
