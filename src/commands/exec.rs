use crate::commands::Dispatcher;
use crate::error::TelemetryResult;
use crate::models::k8s::StreamTarget;
use crate::streams::{ExecOptions, ExecSession};

impl Dispatcher {
    /// Opens a dedicated terminal session in a container.
    ///
    /// - `command` is split shell-style; empty starts `/bin/sh`.
    /// - The session starts at the configured terminal size (80×24 unless
    ///   configured otherwise); call `resize` once the real size is known.
    /// - Returns once the session is open, or fails with `Timeout` /
    ///   `ConnectFailed`.
    pub async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tty: bool,
        command: &str,
    ) -> TelemetryResult<ExecSession> {
        let options = ExecOptions {
            command: command.to_string(),
            tty,
            size: None,
        };
        self.open_exec_with(StreamTarget::new(namespace, pod, container), options)
            .await
    }

    pub async fn open_exec_with(&self, target: StreamTarget, options: ExecOptions) -> TelemetryResult<ExecSession> {
        self.ensure_running()?;
        self.streams.open_exec(target, options).await
    }

    pub fn exec_session_count(&self) -> usize {
        self.streams.exec_session_count()
    }
}
