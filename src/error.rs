use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the client.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Every failure the telemetry client can report to a collaborator.
///
/// Errors are `Clone` so the most recent one can be kept in a status value
/// (namespace watch, log stream, exec session) and handed out repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    /// The transport could not be established.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// An inbound frame could not be decoded. Dropped by the reader.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Write or resize attempted on an exec session that is already closed.
    #[error("exec session is closed")]
    SessionClosed,

    /// Cancel on a subscription the registry no longer knows about.
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// A connect or exec open exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The exec command line could not be split into arguments.
    #[error("invalid exec command: {0}")]
    InvalidCommand(String),

    /// The dispatcher has been shut down.
    #[error("telemetry client is shut down")]
    ShutDown,
}

impl TelemetryError {
    pub fn connect_failed(endpoint: impl ToString, reason: impl ToString) -> Self {
        TelemetryError::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the errors a retry loop should keep trying through.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TelemetryError::ConnectFailed { .. } | TelemetryError::Timeout { .. }
        )
    }
}

/// Errors raised while loading [`crate::config::ClientConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid server url {0:?}: {1}")]
    ServerUrl(String, url::ParseError),
}
