//! In-memory server for exercising the public API end to end.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_telemetry::{Channel, ClientConfig, Endpoint, Incoming, RetryConfig, TelemetryError, Transport};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(3);

pub fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout_ms: 200,
        exec_open_timeout_ms: 200,
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

pub fn pod_frame(name: &str, job: &str, status: &str, created: &str) -> String {
    serde_json::json!({
        "type": "ADDED",
        "kind": "Pod",
        "name": name,
        "status": status,
        "containers": ["main"],
        "image": format!("registry/{job}:1"),
        "metadata": {
            "labels": { "job-name": job },
            "creationTimestamp": created
        }
    })
    .to_string()
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Accepts every connection and hands the server end to the test.
pub struct LoopbackTransport {
    opened: Mutex<Vec<Endpoint>>,
    accepted_tx: mpsc::UnboundedSender<ServerEnd>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        })
    }

    pub fn opened(&self) -> Vec<Endpoint> {
        self.opened.lock().unwrap().clone()
    }

    pub async fn accept(&self) -> ServerEnd {
        let mut rx = self.accepted_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no connection was opened")
            .expect("transport dropped")
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TelemetryError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        self.opened.lock().unwrap().push(endpoint.clone());
        let _ = self.accepted_tx.send(ServerEnd {
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

pub struct ServerEnd {
    pub endpoint: Endpoint,
    to_client: mpsc::Sender<Incoming>,
    from_client: mpsc::Receiver<String>,
}

impl ServerEnd {
    pub async fn send(&self, text: impl Into<String>) {
        self.to_client
            .send(Incoming::Message(text.into()))
            .await
            .expect("client side is closed");
    }

    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing")
    }

    pub async fn closed(&self) {
        tokio::time::timeout(WAIT, self.to_client.closed())
            .await
            .expect("client never closed the connection");
    }
}
