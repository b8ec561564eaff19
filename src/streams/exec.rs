use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::concurrency::{create_shutdown_channel, shutdown_requested, ShutdownRx, ShutdownTx};
use crate::config::{ClientConfig, TerminalSize};
use crate::error::TelemetryError;
use crate::models::frames::{decode_exec_message, ExecClientMessage, ExecServerMessage};
use crate::models::k8s::StreamTarget;
use crate::transport::{Channel, Endpoint, Incoming, Transport};

/// Shell started when the caller gives no command.
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed or dropped by the caller, or the client shut down.
    Local,
    /// The server ended the session.
    Remote,
    Transport(TelemetryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecState {
    Connecting,
    Open,
    Closed(CloseReason),
}

/// What the caller reads from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// Remote terminal output, escape sequences included.
    Output(String),
    /// Connection error banner; always followed by `Closed`.
    Error(String),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Shell-style command line; empty starts [`DEFAULT_SHELL`].
    pub command: String,
    pub tty: bool,
    /// Initial dimensions; the configured terminal size when `None`.
    pub size: Option<TerminalSize>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            tty: true,
            size: None,
        }
    }
}

/// Splits a command line into argv the way a POSIX shell would.
pub fn parse_command(command: &str) -> Result<Vec<String>, TelemetryError> {
    let argv = shell_words::split(command).map_err(|e| TelemetryError::InvalidCommand(e.to_string()))?;
    if argv.is_empty() {
        Ok(vec![DEFAULT_SHELL.to_string()])
    } else {
        Ok(argv)
    }
}

type Sessions = Arc<Mutex<HashMap<u64, ShutdownTx>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens exec sessions. Sessions are never shared: every open is a new
/// connection.
pub struct ExecMultiplexer {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    sessions: Sessions,
    next_id: AtomicU64,
}

impl ExecMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ClientConfig>) -> Self {
        Self {
            transport,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a session and returns once it is `Open`.
    ///
    /// The initial `resize` is sent before the session is handed out, so it
    /// always precedes the caller's input.
    pub async fn open(&self, target: StreamTarget, options: ExecOptions) -> Result<ExecSession, TelemetryError> {
        let command = parse_command(&options.command)?;
        let size = options.size.unwrap_or(self.config.terminal);
        let endpoint = Endpoint::Exec {
            target: target.clone(),
            command,
            tty: options.tty,
        };
        let (state_tx, state_rx) = watch::channel(ExecState::Connecting);

        log::info!("exec: opening {endpoint} (tty={})", options.tty);
        let open_timeout = self.config.exec_open_timeout();
        let channel = match tokio::time::timeout(open_timeout, self.transport.connect(&endpoint)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                return Err(TelemetryError::Timeout {
                    operation: "exec open",
                    after: open_timeout,
                })
            }
        };

        let resize = ExecClientMessage::Resize {
            cols: size.cols,
            rows: size.rows,
        };
        if channel.outbound.send(resize.encode()).await.is_err() {
            return Err(TelemetryError::connect_failed(
                &endpoint,
                "closed before the initial resize",
            ));
        }
        state_tx.send_replace(ExecState::Open);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        lock(&self.sessions).insert(id, shutdown_tx.clone());

        let worker = ExecWorker {
            id,
            endpoint,
            channel,
            input: input_rx,
            output: output_tx,
            state: state_tx,
            shutdown: shutdown_rx,
            sessions: self.sessions.clone(),
        };
        tokio::spawn(worker.run());

        Ok(ExecSession {
            target,
            size: Mutex::new(size),
            input: input_tx,
            output: output_rx,
            state: state_rx,
            shutdown: shutdown_tx,
        })
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn shutdown(&self) {
        for (_, shutdown) in lock(&self.sessions).drain() {
            shutdown.shutdown();
        }
    }
}

/// A dedicated terminal session. Dropping it closes the session.
#[derive(Debug)]
pub struct ExecSession {
    target: StreamTarget,
    size: Mutex<TerminalSize>,
    input: mpsc::UnboundedSender<ExecClientMessage>,
    output: mpsc::UnboundedReceiver<ExecEvent>,
    state: watch::Receiver<ExecState>,
    shutdown: ShutdownTx,
}

impl ExecSession {
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn state(&self) -> ExecState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ExecState::Closed(_))
    }

    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Sends keystrokes to the remote terminal.
    pub fn write(&self, data: impl Into<String>) -> Result<(), TelemetryError> {
        self.send(ExecClientMessage::Stdin { data: data.into() })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TelemetryError> {
        self.send(ExecClientMessage::Resize { cols, rows })?;
        *lock(&self.size) = TerminalSize { cols, rows };
        Ok(())
    }

    fn send(&self, message: ExecClientMessage) -> Result<(), TelemetryError> {
        if self.is_closed() {
            return Err(TelemetryError::SessionClosed);
        }
        self.input
            .send(message)
            .map_err(|_| TelemetryError::SessionClosed)
    }

    /// Next output event; `None` after `Closed` has been read.
    pub async fn next_event(&mut self) -> Option<ExecEvent> {
        self.output.recv().await
    }

    pub fn close(&self) {
        self.shutdown.shutdown();
    }

    /// Waits until the session is closed and returns why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let reason = match state.wait_for(|s| matches!(s, ExecState::Closed(_))).await {
            Ok(state) => match &*state {
                ExecState::Closed(reason) => reason.clone(),
                _ => CloseReason::Local,
            },
            Err(_) => CloseReason::Local,
        };
        reason
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

// ── worker ────────────────────────────────────────────────────────────────────

struct ExecWorker {
    id: u64,
    endpoint: Endpoint,
    channel: Channel,
    input: mpsc::UnboundedReceiver<ExecClientMessage>,
    output: mpsc::UnboundedSender<ExecEvent>,
    state: watch::Sender<ExecState>,
    shutdown: ShutdownRx,
    sessions: Sessions,
}

impl ExecWorker {
    async fn run(mut self) {
        let reason = self.pump().await;
        lock(&self.sessions).remove(&self.id);

        // Refuse further input before publishing Closed. Writes queued before
        // the close can no longer reach the server and are discarded.
        self.input.close();
        let mut discarded = 0usize;
        while self.input.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            log::warn!("exec: {} closed with {discarded} unsent message(s)", self.endpoint);
        }
        self.state.send_replace(ExecState::Closed(reason.clone()));
        match &reason {
            CloseReason::Transport(error) => {
                log::warn!("exec: {} closed by transport error: {error}", self.endpoint);
                let _ = self.output.send(ExecEvent::Error(format!("connection error: {error}")));
            }
            other => log::info!("exec: {} closed ({other:?})", self.endpoint),
        }
        let _ = self.output.send(ExecEvent::Closed(reason));
    }

    async fn pump(&mut self) -> CloseReason {
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return CloseReason::Local,
                message = self.input.recv() => match message {
                    Some(message) => {
                        if self.channel.outbound.send(message.encode()).await.is_err() {
                            return CloseReason::Transport(TelemetryError::connect_failed(
                                &self.endpoint,
                                "connection closed while writing",
                            ));
                        }
                    }
                    None => return CloseReason::Local,
                },
                incoming = self.channel.inbound.recv() => match incoming {
                    Some(Incoming::Message(text)) => match decode_exec_message(&text) {
                        Ok(ExecServerMessage::Stdout { data }) => {
                            let _ = self.output.send(ExecEvent::Output(data));
                        }
                        Err(e) => log::debug!("exec: dropping message on {}: {e}", self.endpoint),
                    },
                    Some(Incoming::Failed(reason)) => {
                        return CloseReason::Transport(TelemetryError::connect_failed(&self.endpoint, reason));
                    }
                    None => return CloseReason::Remote,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_config, StubMode, StubTransport};

    fn multiplexer(transport: Arc<StubTransport>) -> ExecMultiplexer {
        ExecMultiplexer::new(transport, Arc::new(fast_config()))
    }

    fn target() -> StreamTarget {
        StreamTarget::new("ml", "train-1-x", "main")
    }

    fn options(command: &str) -> ExecOptions {
        ExecOptions {
            command: command.to_string(),
            ..ExecOptions::default()
        }
    }

    #[test]
    fn command_lines_are_split_shell_style() {
        assert_eq!(parse_command("").unwrap(), vec![DEFAULT_SHELL]);
        assert_eq!(
            parse_command("sh -c 'echo hi there'").unwrap(),
            vec!["sh", "-c", "echo hi there"]
        );
        assert!(matches!(
            parse_command("sh -c 'unterminated"),
            Err(TelemetryError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn initial_resize_precedes_input_and_output_flows() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let mut session = exec.open(target(), options("bash")).await.unwrap();
        let mut server = transport.accept().await;
        assert_eq!(session.state(), ExecState::Open);
        assert_eq!(session.size(), TerminalSize { cols: 80, rows: 24 });

        session.write("ls\n").unwrap();
        session.resize(120, 40).unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            r#"{"type":"resize","cols":80,"rows":24}"#
        );
        assert_eq!(server.recv().await.unwrap(), r#"{"type":"stdin","data":"ls\n"}"#);
        assert_eq!(
            server.recv().await.unwrap(),
            r#"{"type":"resize","cols":120,"rows":40}"#
        );
        assert_eq!(session.size(), TerminalSize { cols: 120, rows: 40 });

        server.send(r#"{"type":"stdout","data":"a.txt\r\n"}"#).await;
        server.send(r#"{"type":"telemetry"}"#).await;
        server.send(r#"{"type":"stdout","data":"$ "}"#).await;
        assert_eq!(session.next_event().await, Some(ExecEvent::Output("a.txt\r\n".into())));
        assert_eq!(session.next_event().await, Some(ExecEvent::Output("$ ".into())));
    }

    #[tokio::test]
    async fn operations_after_remote_close_fail() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let mut session = exec.open(target(), options("")).await.unwrap();
        let server = transport.accept().await;
        drop(server);

        assert_eq!(session.closed().await, CloseReason::Remote);
        assert_eq!(session.write("x"), Err(TelemetryError::SessionClosed));
        assert_eq!(session.resize(10, 10), Err(TelemetryError::SessionClosed));
        assert_eq!(session.next_event().await, Some(ExecEvent::Closed(CloseReason::Remote)));
        assert_eq!(exec.session_count(), 0);
    }

    #[tokio::test]
    async fn unsent_input_is_discarded_when_the_server_goes_away() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let mut session = exec.open(target(), options("")).await.unwrap();
        let server = transport.accept().await;
        // More than the channel holds, so part of it is still queued locally.
        for i in 0..300 {
            session.write(format!("line {i}\n")).unwrap();
        }
        drop(server);

        let reason = session.closed().await;
        assert!(matches!(reason, CloseReason::Remote | CloseReason::Transport(_)));
        assert_eq!(session.write("more"), Err(TelemetryError::SessionClosed));
        loop {
            match session.next_event().await {
                Some(ExecEvent::Closed(closed)) => {
                    assert_eq!(closed, reason);
                    break;
                }
                Some(_) => {}
                None => panic!("event stream ended without Closed"),
            }
        }
        assert_eq!(exec.session_count(), 0);
    }

    #[tokio::test]
    async fn transport_error_shows_banner_then_closes() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let mut session = exec.open(target(), options("")).await.unwrap();
        let server = transport.accept().await;
        server.fail("connection reset").await;

        match session.next_event().await {
            Some(ExecEvent::Error(banner)) => assert!(banner.contains("connection reset")),
            other => panic!("expected error banner, got {other:?}"),
        }
        assert!(matches!(
            session.next_event().await,
            Some(ExecEvent::Closed(CloseReason::Transport(_)))
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn sessions_are_never_shared() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let first = exec.open(target(), options("sh")).await.unwrap();
        let _first_server = transport.accept().await;
        let second = exec.open(target(), options("sh")).await.unwrap();
        let _second_server = transport.accept().await;

        assert_eq!(exec.session_count(), 2);
        first.close();
        assert_eq!(first.closed().await, CloseReason::Local);
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn dropping_the_session_closes_the_connection() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        let session = exec.open(target(), options("")).await.unwrap();
        let server = transport.accept().await;
        drop(session);

        server.closed().await;
    }

    #[tokio::test]
    async fn open_failures_are_distinguishable() {
        let transport = StubTransport::new();
        let exec = multiplexer(transport.clone());

        transport.set_mode(StubMode::Hang);
        assert!(matches!(
            exec.open(target(), options("")).await,
            Err(TelemetryError::Timeout { operation: "exec open", .. })
        ));

        transport.set_mode(StubMode::Refuse);
        assert!(matches!(
            exec.open(target(), options("")).await,
            Err(TelemetryError::ConnectFailed { .. })
        ));

        assert!(matches!(
            exec.open(target(), options("sh -c 'oops")).await,
            Err(TelemetryError::InvalidCommand(_))
        ));
    }
}
