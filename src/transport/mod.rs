use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TelemetryError;
use crate::models::k8s::StreamTarget;

pub mod ws;

pub use ws::WsTransport;

/// Buffer size of both directions of a [`Channel`].
pub const CHANNEL_CAPACITY: usize = 256;

/// What a connection is for; decides the URL it is opened on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Watch { namespace: String },
    Log(StreamTarget),
    Exec {
        target: StreamTarget,
        command: Vec<String>,
        tty: bool,
    },
}

impl Endpoint {
    /// Resolves the endpoint against the service base URL.
    ///
    /// Path segments are percent-encoded; exec arguments become repeated
    /// `command` query parameters.
    pub fn url(&self, base: &Url) -> Result<Url, TelemetryError> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TelemetryError::connect_failed(base, "server url cannot be a base"))?;
            segments.pop_if_empty();
            match self {
                Endpoint::Watch { namespace } => {
                    segments.extend(["watch", namespace.as_str()]);
                }
                Endpoint::Log(t) => {
                    segments.extend(["logs", t.namespace.as_str(), t.pod.as_str(), t.container.as_str()]);
                }
                Endpoint::Exec { target: t, .. } => {
                    segments.extend(["exec", t.namespace.as_str(), t.pod.as_str(), t.container.as_str()]);
                }
            }
        }

        if let Endpoint::Exec { command, tty, .. } = self {
            let mut query = url.query_pairs_mut();
            for arg in command {
                query.append_pair("command", arg);
            }
            query.append_pair("tty", if *tty { "true" } else { "false" });
        }

        Ok(url)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Watch { namespace } => write!(f, "watch/{namespace}"),
            Endpoint::Log(t) => write!(f, "logs/{t}"),
            Endpoint::Exec { target, .. } => write!(f, "exec/{target}"),
        }
    }
}

/// A message read from an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Message(String),
    /// Transport failure; nothing follows it.
    Failed(String),
}

/// Both directions of an open connection.
///
/// The connection closes when either half is dropped; the remote side closing
/// shows up as `inbound` returning `None`.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<Incoming>,
}

/// Opens connections to the cluster-watch service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TelemetryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("wss://watch.example.com/api/v1/").unwrap()
    }

    #[test]
    fn watch_and_log_urls() {
        let watch = Endpoint::Watch { namespace: "ml-team".into() };
        assert_eq!(
            watch.url(&base()).unwrap().as_str(),
            "wss://watch.example.com/api/v1/watch/ml-team"
        );

        let log = Endpoint::Log(StreamTarget::new("ml", "train-1-x", "main"));
        assert_eq!(
            log.url(&base()).unwrap().as_str(),
            "wss://watch.example.com/api/v1/logs/ml/train-1-x/main"
        );
    }

    #[test]
    fn exec_url_carries_command_and_tty() {
        let exec = Endpoint::Exec {
            target: StreamTarget::new("ml", "p", "c"),
            command: vec!["sh".into(), "-c".into(), "ls -la".into()],
            tty: true,
        };
        assert_eq!(
            exec.url(&base()).unwrap().as_str(),
            "wss://watch.example.com/api/v1/exec/ml/p/c?command=sh&command=-c&command=ls+-la&tty=true"
        );
    }
}
