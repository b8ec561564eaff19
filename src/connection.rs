use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::concurrency::{create_shutdown_channel, shutdown_requested, Backoff, ShutdownRx, ShutdownTx};
use crate::config::ClientConfig;
use crate::error::TelemetryError;
use crate::models::frames::decode_resource_frame;
use crate::store::ResourceStore;
use crate::transport::{Channel, Endpoint, Incoming, Transport};

/// Connection state of one watched namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceStatus {
    Connecting,
    Connected,
    /// Down; `attempt` is the number of the next connect attempt.
    Reconnecting {
        attempt: u32,
        last_error: TelemetryError,
    },
    /// `retry.max_attempts` consecutive connects failed. Retrying continues.
    Failed(TelemetryError),
}

/// One reference to a namespace watch. Give it back with
/// [`ConnectionManager::unwatch`]; dropping it keeps the watch open.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the namespace stays watched until the handle is given back"]
pub struct WatchHandle {
    namespace: String,
}

impl WatchHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

struct NamespaceWatch {
    refs: usize,
    shutdown: ShutdownTx,
    task: JoinHandle<()>,
    status: watch::Receiver<NamespaceStatus>,
}

#[derive(Default)]
struct Registry {
    watches: HashMap<String, NamespaceWatch>,
    /// Namespaces whose worker is stopping. The teardown holds the sender and
    /// drops it once the namespace is evicted.
    closing: HashMap<String, watch::Receiver<()>>,
}

impl Registry {
    fn begin_closing(&mut self, namespace: &str) -> watch::Sender<()> {
        let (done_tx, done_rx) = watch::channel(());
        self.closing.insert(namespace.to_string(), done_rx);
        done_tx
    }
}

/// Keeps at most one live connection per namespace, shared by every caller
/// that watches it.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    store: ResourceStore,
    config: Arc<ClientConfig>,
    // Never held across a teardown.
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, store: ResourceStore, config: Arc<ClientConfig>) -> Self {
        Self {
            transport,
            store,
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Adds a reference to `namespace`, opening its connection on the first.
    ///
    /// If the namespace is still being torn down, waits for that to finish so
    /// the new connection never races the old eviction.
    pub async fn watch(&self, namespace: &str) -> WatchHandle {
        loop {
            let mut registry = self.registry.lock().await;

            if let Some(closing) = registry.closing.get(namespace) {
                let mut closing = closing.clone();
                drop(registry);
                // Errors once the teardown drops its sender.
                let _ = closing.changed().await;
                continue;
            }

            if let Some(entry) = registry.watches.get_mut(namespace) {
                entry.refs += 1;
                log::debug!("watch: {namespace:?} now has {} watcher(s)", entry.refs);
            } else {
                let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
                let (status_tx, status_rx) = watch::channel(NamespaceStatus::Connecting);
                let worker = NamespaceWorker {
                    namespace: namespace.to_string(),
                    endpoint: Endpoint::Watch {
                        namespace: namespace.to_string(),
                    },
                    transport: self.transport.clone(),
                    store: self.store.clone(),
                    config: self.config.clone(),
                    status: status_tx,
                    shutdown: shutdown_rx,
                };
                log::info!("watch: opening namespace {namespace:?}");
                registry.watches.insert(
                    namespace.to_string(),
                    NamespaceWatch {
                        refs: 1,
                        shutdown: shutdown_tx,
                        task: tokio::spawn(worker.run()),
                        status: status_rx,
                    },
                );
            }

            return WatchHandle {
                namespace: namespace.to_string(),
            };
        }
    }

    pub async fn unwatch(&self, handle: WatchHandle) {
        self.release(&handle.namespace).await;
    }

    /// Drops one reference to `namespace`. The last one closes the connection
    /// and evicts the namespace from the store before returning.
    ///
    /// Returns `false` if the namespace was not watched.
    pub async fn release(&self, namespace: &str) -> bool {
        let (entry, done) = {
            let mut registry = self.registry.lock().await;

            let Some(entry) = registry.watches.get_mut(namespace) else {
                log::debug!("watch: release of unwatched namespace {namespace:?} ignored");
                return false;
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                return true;
            }

            let Some(entry) = registry.watches.remove(namespace) else {
                return true;
            };
            (entry, registry.begin_closing(namespace))
        };

        self.teardown(namespace, entry, done).await;
        true
    }

    async fn teardown(&self, namespace: &str, entry: NamespaceWatch, done: watch::Sender<()>) {
        entry.shutdown.shutdown();
        let mut task = entry.task;
        if tokio::time::timeout(self.config.shutdown_grace(), &mut task)
            .await
            .is_err()
        {
            log::warn!("watch: worker for {namespace:?} did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }
        self.store.evict_namespace(namespace);

        // Only this teardown can own the marker: re-watches wait for it.
        self.registry.lock().await.closing.remove(namespace);
        drop(done);
        log::info!("watch: closed namespace {namespace:?}");
    }

    pub async fn status(&self, namespace: &str) -> Option<NamespaceStatus> {
        let registry = self.registry.lock().await;
        registry.watches.get(namespace).map(|w| w.status.borrow().clone())
    }

    pub async fn watched(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut namespaces: Vec<String> = registry.watches.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Closes every namespace regardless of reference counts. Namespaces are
    /// torn down concurrently.
    pub async fn shutdown(&self) {
        let mut closing = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            let drained: Vec<_> = registry.watches.drain().collect();
            for (namespace, entry) in drained {
                let done = registry.begin_closing(&namespace);
                closing.push((namespace, entry, done));
            }
        }

        join_all(
            closing
                .into_iter()
                .map(|(namespace, entry, done)| async move { self.teardown(&namespace, entry, done).await }),
        )
        .await;
    }
}

// ── worker ────────────────────────────────────────────────────────────────────

enum PumpExit {
    Shutdown,
    Lost(TelemetryError),
}

struct NamespaceWorker {
    namespace: String,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    store: ResourceStore,
    config: Arc<ClientConfig>,
    status: watch::Sender<NamespaceStatus>,
    shutdown: ShutdownRx,
}

impl NamespaceWorker {
    async fn run(mut self) {
        let mut backoff = Backoff::new(&self.config.retry);
        let mut failures: u32 = 0;
        let mut resync = false;
        let connect_timeout = self.config.connect_timeout();

        loop {
            let connect = tokio::time::timeout(connect_timeout, self.transport.connect(&self.endpoint));
            let result = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return,
                result = connect => result,
            };

            let channel = match result {
                Ok(Ok(channel)) => channel,
                Ok(Err(error)) => {
                    failures += 1;
                    if !self.connect_failed(failures, error, backoff.next_delay()).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    failures += 1;
                    let error = TelemetryError::Timeout {
                        operation: "namespace connect",
                        after: connect_timeout,
                    };
                    if !self.connect_failed(failures, error, backoff.next_delay()).await {
                        return;
                    }
                    continue;
                }
            };

            failures = 0;
            backoff.reset();
            if resync {
                // The server replays the namespace on connect; anything it no
                // longer has must not outlive the outage.
                let dropped = self.store.evict_namespace(&self.namespace);
                log::info!(
                    "watch: reconnected to {}, dropped {dropped} record(s) for resync",
                    self.endpoint
                );
            } else {
                log::info!("watch: connected to {}", self.endpoint);
            }
            resync = true;
            self.status.send_replace(NamespaceStatus::Connected);

            match self.pump(channel).await {
                PumpExit::Shutdown => return,
                PumpExit::Lost(error) => {
                    log::warn!("watch: lost {}: {error}", self.endpoint);
                    self.store.mark_stale(&self.namespace);
                    self.status.send_replace(NamespaceStatus::Reconnecting {
                        attempt: 1,
                        last_error: error,
                    });
                    if !self.pause(backoff.next_delay()).await {
                        return;
                    }
                }
            }
        }
    }

    /// Records a failed connect and waits out the backoff. Returns `false`
    /// when shutdown arrived meanwhile.
    async fn connect_failed(&mut self, failures: u32, error: TelemetryError, delay: Duration) -> bool {
        log::warn!(
            "watch: connect attempt {failures} for {} failed: {error}",
            self.endpoint
        );
        self.store.mark_stale(&self.namespace);

        let status = if failures >= self.config.retry.max_attempts {
            NamespaceStatus::Failed(error)
        } else {
            NamespaceStatus::Reconnecting {
                attempt: failures + 1,
                last_error: error,
            }
        };
        self.status.send_replace(status);
        self.pause(delay).await
    }

    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn pump(&mut self, mut channel: Channel) -> PumpExit {
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return PumpExit::Shutdown,
                incoming = channel.inbound.recv() => match incoming {
                    Some(Incoming::Message(text)) => self.ingest(&text),
                    Some(Incoming::Failed(reason)) => {
                        return PumpExit::Lost(TelemetryError::connect_failed(&self.endpoint, reason));
                    }
                    None => {
                        return PumpExit::Lost(TelemetryError::connect_failed(
                            &self.endpoint,
                            "connection closed by server",
                        ));
                    }
                },
            }
        }
    }

    fn ingest(&self, text: &str) {
        match decode_resource_frame(text, &self.namespace) {
            Ok(event) => self.store.apply(event),
            Err(e) => log::warn!("watch: dropping frame on {}: {e}", self.endpoint),
        }
    }
}
