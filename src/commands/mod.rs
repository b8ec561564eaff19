//! Collaborator-facing entry point.
//!
//! [`Dispatcher`] is the only surface the UI layer calls. It owns the store,
//! the namespace connections and the stream registries, and hides their
//! reference counting. Operations are grouped by feature:
//! - `pods`: namespace watches, pod and job views, change feed
//! - `logs`: log tailing
//! - `exec`: terminal sessions
//! - `health`: server reachability probe

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{TelemetryError, TelemetryResult};
use crate::store::ResourceStore;
use crate::streams::SubscriptionMultiplexer;
use crate::transport::{Transport, WsTransport};

pub mod exec;
pub mod health;
pub mod logs;
pub mod pods;

pub struct Dispatcher {
    config: Arc<ClientConfig>,
    store: ResourceStore,
    connections: ConnectionManager,
    streams: SubscriptionMultiplexer,
    shut_down: AtomicBool,
}

impl Dispatcher {
    /// Builds a dispatcher over an arbitrary transport.
    pub fn create(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let store = ResourceStore::new();
        Self {
            connections: ConnectionManager::new(transport.clone(), store.clone(), config.clone()),
            streams: SubscriptionMultiplexer::new(transport, config.clone()),
            store,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Builds a dispatcher that talks WebSocket to `config.server_url`.
    pub fn connect(config: ClientConfig) -> Self {
        let transport = Arc::new(WsTransport::new(config.server_url.clone()));
        Self::create(config, transport)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn ensure_running(&self) -> TelemetryResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(TelemetryError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Closes every watch, log stream and exec session. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("dispatcher: shutting down");
        self.streams.shutdown();
        self.connections.shutdown().await;
    }
}
