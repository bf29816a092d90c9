#![allow(dead_code, clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use viewlink_engine::*;
use viewlink_engine::protocol::Command;

/// The far end of a mock link.
pub struct ServerSide {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerSide {
    /// Next JSON frame the client sent.
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(120), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link");
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame that is not a keepalive ping.
    pub async fn next_command(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }

    pub fn send(&self, value: Value) {
        self.to_client
            .send(TransportEvent::Frame(value.to_string()))
            .unwrap();
    }

    pub fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed { reason: None });
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Error(reason.to_string()));
    }
}

/// In-memory connector. Every successful open hands its server side to the test.
pub struct MockConnector {
    refusing: AtomicBool,
    failures_left: AtomicU32,
    opens: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            refusing: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
            opens: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    /// Refuse every open until cleared.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Refuse the next `n` opens.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _endpoint: &str) -> Result<Link, EngineError> {
        self.opens.lock().push(Instant::now());

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.refusing.load(Ordering::SeqCst) || scripted_failure {
            return Err(EngineError::Transport("connection refused".to_string()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerSide {
            from_client,
            to_client,
        });
        Ok(Link { outbound, inbound })
    }
}

/// Renderer that records what it applied.
#[derive(Default)]
pub struct RecordingRenderer {
    applied: Mutex<Vec<Command>>,
    failing: AtomicBool,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<Command> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn apply(&self, command: &Command) -> Result<(), String> {
        self.applied.lock().push(command.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(format!("cannot apply {}", command.kind));
        }
        Ok(())
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        max_attempts: 5,
        keepalive_interval_ms: 30_000,
        connect_timeout_ms: 10_000,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        endpoint: "ws://viewer.test/ws".to_string(),
        connection: connection_config(),
        ..EngineConfig::default()
    }
}

pub fn params(value: Value) -> viewlink_engine::protocol::Parameters {
    value.as_object().cloned().unwrap()
}

/// Wait for the next report, bounded in virtual time.
pub async fn next_report(
    reports: &mut tokio::sync::broadcast::Receiver<CommandReport>,
) -> CommandReport {
    tokio::time::timeout(Duration::from_secs(60), reports.recv())
        .await
        .expect("timed out waiting for a command report")
        .unwrap()
}
