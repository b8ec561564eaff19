use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};

use crate::concurrency::{create_shutdown_channel, shutdown_requested, Backoff, ShutdownRx, ShutdownTx};
use crate::config::ClientConfig;
use crate::error::TelemetryError;
use crate::models::frames::decode_log_line;
use crate::models::k8s::StreamTarget;
use crate::transport::{Channel, Endpoint, Incoming, Transport};

/// State of the log stream behind a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Streaming,
    /// The server closed the stream, e.g. the container exited.
    Ended,
    Failed(TelemetryError),
}

type SubscriberId = u64;

#[derive(Default)]
struct Fanout {
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<String>>,
}

struct LogStream {
    stream_id: u64,
    fanout: Arc<Mutex<Fanout>>,
    shutdown: ShutdownTx,
    status: watch::Receiver<StreamStatus>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamTarget, LogStream>,
    next_id: u64,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    // Lock order: registry before any fanout.
    registry: Mutex<Registry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn cancel(&self, target: &StreamTarget, subscriber: SubscriberId) -> Result<(), TelemetryError> {
        let mut registry = lock(&self.registry);
        let Some(stream) = registry.streams.get(target) else {
            return Err(TelemetryError::SubscriptionNotFound);
        };

        let remaining = {
            let mut fanout = lock(&stream.fanout);
            if fanout.subscribers.remove(&subscriber).is_none() {
                return Err(TelemetryError::SubscriptionNotFound);
            }
            fanout.subscribers.len()
        };

        if remaining == 0 {
            if let Some(stream) = registry.streams.remove(target) {
                stream.shutdown.shutdown();
                log::info!("logs: last subscriber left, closing {target}");
            }
        }
        Ok(())
    }

    /// Called by a worker whose stream ended on its own.
    fn finish(&self, target: &StreamTarget, stream_id: u64) {
        let mut registry = lock(&self.registry);
        if registry
            .streams
            .get(target)
            .is_some_and(|s| s.stream_id == stream_id)
        {
            registry.streams.remove(target);
        }
    }
}

/// Shares one log stream per container among any number of subscribers.
pub struct LogMultiplexer {
    shared: Arc<Shared>,
}

impl LogMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ClientConfig>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Registers a subscriber for `target`, opening the stream if it is the
    /// first. Returns as soon as the subscriber is registered; lines arrive
    /// from this point on.
    pub fn subscribe(&self, target: StreamTarget) -> LogSubscription {
        let mut registry = lock(&self.shared.registry);
        registry.next_id += 1;
        let subscriber = registry.next_id;
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let status = if let Some(stream) = registry.streams.get(&target) {
            lock(&stream.fanout).subscribers.insert(subscriber, line_tx);
            log::debug!("logs: attached subscriber {subscriber} to {target}");
            stream.status.clone()
        } else {
            registry.next_id += 1;
            let stream_id = registry.next_id;
            let mut fanout = Fanout::default();
            fanout.subscribers.insert(subscriber, line_tx);
            let fanout = Arc::new(Mutex::new(fanout));
            let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
            let (status_tx, status_rx) = watch::channel(StreamStatus::Connecting);

            let worker = LogWorker {
                target: target.clone(),
                stream_id,
                endpoint: Endpoint::Log(target.clone()),
                transport: self.shared.transport.clone(),
                config: self.shared.config.clone(),
                fanout: fanout.clone(),
                shared: Arc::downgrade(&self.shared),
                status: status_tx,
                shutdown: shutdown_rx,
            };
            tokio::spawn(worker.run());
            log::info!("logs: opening stream for {target}");

            registry.streams.insert(
                target.clone(),
                LogStream {
                    stream_id,
                    fanout,
                    shutdown: shutdown_tx,
                    status: status_rx.clone(),
                },
            );
            status_rx
        };

        LogSubscription {
            lines: line_rx,
            status,
            handle: LogCancelHandle {
                target,
                subscriber,
                shared: Arc::downgrade(&self.shared),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Number of open streams.
    pub fn stream_count(&self) -> usize {
        lock(&self.shared.registry).streams.len()
    }

    pub fn subscriber_count(&self, target: &StreamTarget) -> usize {
        lock(&self.shared.registry)
            .streams
            .get(target)
            .map(|s| lock(&s.fanout).subscribers.len())
            .unwrap_or(0)
    }

    /// Ends every stream; all subscribers see their line receiver close.
    pub fn shutdown(&self) {
        let mut registry = lock(&self.shared.registry);
        for (target, stream) in registry.streams.drain() {
            lock(&stream.fanout).subscribers.clear();
            stream.shutdown.shutdown();
            log::debug!("logs: closed {target} on shutdown");
        }
    }
}

// ── subscriber side ───────────────────────────────────────────────────────────

/// Cancels one subscription. Clones share the same subscription; cancelling
/// more than once, or after the stream is gone, does nothing.
#[derive(Debug, Clone)]
pub struct LogCancelHandle {
    target: StreamTarget,
    subscriber: SubscriberId,
    shared: Weak<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl LogCancelHandle {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.cancel(&self.target, self.subscriber) {
            log::debug!("logs: cancel of subscriber {} on {}: {e}", self.subscriber, self.target);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }
}

/// One subscriber's view of a log stream. Dropping it cancels.
#[derive(Debug)]
pub struct LogSubscription {
    lines: mpsc::UnboundedReceiver<String>,
    status: watch::Receiver<StreamStatus>,
    handle: LogCancelHandle,
}

impl LogSubscription {
    pub fn target(&self) -> &StreamTarget {
        self.handle.target()
    }

    /// Next line, or `None` once the subscription is cancelled and drained or
    /// the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn try_next_line(&mut self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn cancel_handle(&self) -> LogCancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

// ── worker ────────────────────────────────────────────────────────────────────

enum StreamExit {
    Shutdown,
    Ended,
    Failed(TelemetryError),
}

struct LogWorker {
    target: StreamTarget,
    stream_id: u64,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    fanout: Arc<Mutex<Fanout>>,
    shared: Weak<Shared>,
    status: watch::Sender<StreamStatus>,
    shutdown: ShutdownRx,
}

impl LogWorker {
    async fn run(mut self) {
        let exit = self.stream().await;

        let status = match exit {
            StreamExit::Shutdown => {
                log::debug!("logs: stream for {} stopped", self.target);
                StreamStatus::Ended
            }
            StreamExit::Ended => {
                log::info!("logs: server ended stream for {}", self.target);
                StreamStatus::Ended
            }
            StreamExit::Failed(error) => {
                log::warn!("logs: stream for {} failed: {error}", self.target);
                StreamStatus::Failed(error)
            }
        };
        // Unregister first so a subscribe racing with the end opens a new
        // stream instead of joining this one.
        if let Some(shared) = self.shared.upgrade() {
            shared.finish(&self.target, self.stream_id);
        }
        self.status.send_replace(status);
        // Dropping the senders ends every subscriber's line receiver.
        lock(&self.fanout).subscribers.clear();
    }

    async fn stream(&mut self) -> StreamExit {
        let mut channel = match self.connect().await {
            Ok(channel) => channel,
            Err(exit) => return exit,
        };
        self.status.send_replace(StreamStatus::Streaming);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return StreamExit::Shutdown,
                incoming = channel.inbound.recv() => match incoming {
                    Some(Incoming::Message(text)) => self.deliver(decode_log_line(&text)),
                    Some(Incoming::Failed(reason)) => {
                        return StreamExit::Failed(TelemetryError::connect_failed(&self.endpoint, reason));
                    }
                    None => return StreamExit::Ended,
                },
            }
        }
    }

    /// Connects with retry; gives up after `retry.max_attempts` failures.
    async fn connect(&mut self) -> Result<Channel, StreamExit> {
        let mut backoff = Backoff::new(&self.config.retry);
        let connect_timeout = self.config.connect_timeout();
        let mut failures = 0;

        loop {
            let connect = tokio::time::timeout(connect_timeout, self.transport.connect(&self.endpoint));
            let error = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Err(StreamExit::Shutdown),
                result = connect => match result {
                    Ok(Ok(channel)) => return Ok(channel),
                    Ok(Err(error)) => error,
                    Err(_) => TelemetryError::Timeout {
                        operation: "log stream connect",
                        after: connect_timeout,
                    },
                },
            };

            failures += 1;
            if failures >= self.config.retry.max_attempts || !error.is_transient() {
                return Err(StreamExit::Failed(error));
            }
            log::warn!("logs: connect attempt {failures} for {} failed: {error}", self.endpoint);

            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Err(StreamExit::Shutdown),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    fn deliver(&self, line: &str) {
        let fanout = lock(&self.fanout);
        for tx in fanout.subscribers.values() {
            let _ = tx.send(line.to_string());
        }
    }
}
