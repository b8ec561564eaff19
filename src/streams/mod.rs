//! On-demand streams layered beside the namespace watches: shared log tails
//! and dedicated exec sessions.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::TelemetryError;
use crate::models::k8s::StreamTarget;
use crate::transport::Transport;

pub mod exec;
pub mod logs;

pub use exec::{CloseReason, ExecEvent, ExecOptions, ExecSession, ExecState};
pub use logs::{LogCancelHandle, LogSubscription, StreamStatus};

use exec::ExecMultiplexer;
use logs::LogMultiplexer;

pub struct SubscriptionMultiplexer {
    logs: LogMultiplexer,
    exec: ExecMultiplexer,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ClientConfig>) -> Self {
        Self {
            logs: LogMultiplexer::new(transport.clone(), config.clone()),
            exec: ExecMultiplexer::new(transport, config),
        }
    }

    pub fn subscribe_log(&self, target: StreamTarget) -> LogSubscription {
        self.logs.subscribe(target)
    }

    pub async fn open_exec(&self, target: StreamTarget, options: ExecOptions) -> Result<ExecSession, TelemetryError> {
        self.exec.open(target, options).await
    }

    pub fn log_stream_count(&self) -> usize {
        self.logs.stream_count()
    }

    pub fn exec_session_count(&self) -> usize {
        self.exec.session_count()
    }

    pub fn shutdown(&self) {
        self.logs.shutdown();
        self.exec.shutdown();
    }
}
