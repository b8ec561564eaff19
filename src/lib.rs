//! Client-side telemetry for a Kubernetes cluster-watch service.
//!
//! Keeps a live, per-namespace view of pods fed over WebSocket, derives jobs
//! from pod labels and owner references, and multiplexes container log tails
//! and exec sessions. Everything the UI needs goes through [`Dispatcher`].
//!
//! The crate logs through the `log` facade and installs no logger.

pub mod commands;
pub mod concurrency;
pub mod config;
pub mod connection;
pub mod error;
pub mod jobs;
pub mod models;
pub mod store;
pub mod streams;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use commands::health::ServerHealth;
pub use commands::Dispatcher;
pub use config::{ClientConfig, RetryConfig, TerminalSize};
pub use connection::{NamespaceStatus, WatchHandle};
pub use error::{ConfigError, TelemetryError, TelemetryResult};
pub use jobs::infer;
pub use models::k8s::{
    EventAction, InferredJob, JobStatus, OwnerReference, PodRecord, ResourceEvent, ResourceKey, StreamTarget,
};
pub use store::StoreChange;
pub use streams::{
    CloseReason, ExecEvent, ExecOptions, ExecSession, ExecState, LogCancelHandle, LogSubscription, StreamStatus,
};
pub use transport::{Channel, Endpoint, Incoming, Transport, WsTransport};
