//! Fixtures and an in-memory transport for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::{ClientConfig, RetryConfig};
use crate::error::TelemetryError;
use crate::models::k8s::{EventAction, PodRecord, ResourceEvent, POD_KIND};
use crate::transport::{Channel, Endpoint, Incoming, Transport, CHANNEL_CAPACITY};

const WAIT: Duration = Duration::from_secs(3);

pub fn pod_event(namespace: &str, name: &str, status: &str) -> ResourceEvent {
    ResourceEvent {
        action: EventAction::Upsert,
        kind: POD_KIND.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        status: status.to_string(),
        containers: vec!["main".to_string()],
        labels: HashMap::new(),
        owner_references: Vec::new(),
        creation_timestamp: None,
        image: None,
        raw: serde_json::json!({ "kind": POD_KIND, "name": name }),
    }
}

pub fn pod_record(namespace: &str, name: &str, status: &str, first_seen: u64) -> PodRecord {
    PodRecord {
        name: name.to_string(),
        namespace: namespace.to_string(),
        containers: vec!["main".to_string()],
        status: status.to_string(),
        labels: HashMap::new(),
        owner_references: Vec::new(),
        creation_timestamp: None,
        image: None,
        first_seen,
        last_updated: Utc::now(),
        stale: false,
    }
}

/// Watch frame text for a pod labelled with `job`.
pub fn job_pod_frame(name: &str, job: &str, status: &str) -> String {
    serde_json::json!({
        "kind": "Pod",
        "name": name,
        "status": status,
        "containers": ["main"],
        "metadata": { "labels": { "job-name": job } }
    })
    .to_string()
}

/// Short timeouts and delays so failure paths finish quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        connect_timeout_ms: 100,
        exec_open_timeout_ms: 100,
        shutdown_grace_ms: 200,
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 20,
            backoff_factor: 2.0,
        },
        ..ClientConfig::default()
    }
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── stub transport ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    Accept,
    Refuse,
    /// `connect` never resolves.
    Hang,
}

struct StubState {
    mode: StubMode,
    refuse_next: u32,
    attempts: Vec<Endpoint>,
    opened: Vec<Endpoint>,
}

/// In-memory [`Transport`] that hands the server side of every accepted
/// connection to the test.
pub struct StubTransport {
    state: Mutex<StubState>,
    accepted_tx: mpsc::UnboundedSender<StubServer>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StubServer>>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(StubState {
                mode: StubMode::Accept,
                refuse_next: 0,
                attempts: Vec::new(),
                opened: Vec::new(),
            }),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        })
    }

    pub fn set_mode(&self, mode: StubMode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Refuses the next `n` connects whatever the mode.
    pub fn refuse_next(&self, n: u32) {
        self.state.lock().unwrap().refuse_next = n;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    /// Number of successful connects to `endpoint`.
    pub fn opened(&self, endpoint: &Endpoint) -> usize {
        self.state
            .lock()
            .unwrap()
            .opened
            .iter()
            .filter(|e| *e == endpoint)
            .count()
    }

    /// Waits for the next accepted connection.
    pub async fn accept(&self) -> StubServer {
        let mut rx = self.accepted_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no connection was opened")
            .expect("stub transport dropped")
    }

    /// True if a connection was accepted that no test has taken yet.
    pub async fn has_pending(&self) -> bool {
        !self.accepted_rx.lock().await.is_empty()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TelemetryError> {
        let mode = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(endpoint.clone());
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                StubMode::Refuse
            } else {
                state.mode
            }
        };

        match mode {
            StubMode::Refuse => Err(TelemetryError::connect_failed(endpoint, "refused by stub")),
            StubMode::Hang => std::future::pending().await,
            StubMode::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
                let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
                self.state.lock().unwrap().opened.push(endpoint.clone());
                let _ = self.accepted_tx.send(StubServer {
                    endpoint: endpoint.clone(),
                    to_client: inbound_tx,
                    from_client: outbound_rx,
                });
                Ok(Channel {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                })
            }
        }
    }
}

/// Server end of a stub connection. Dropping it closes the connection from
/// the remote side.
pub struct StubServer {
    pub endpoint: Endpoint,
    to_client: mpsc::Sender<Incoming>,
    from_client: mpsc::Receiver<String>,
}

impl StubServer {
    pub async fn send(&self, text: impl Into<String>) {
        self.to_client
            .send(Incoming::Message(text.into()))
            .await
            .expect("client side is closed");
    }

    pub async fn fail(&self, reason: &str) {
        let _ = self.to_client.send(Incoming::Failed(reason.to_string())).await;
    }

    /// Next message written by the client.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing")
    }

    /// Waits until the client has closed its end.
    pub async fn closed(&self) {
        tokio::time::timeout(WAIT, self.to_client.closed())
            .await
            .expect("client never closed the connection");
    }

    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}
