use std::time::Duration;

use tokio::sync::watch;

use crate::config::RetryConfig;

// ── shutdown signal ───────────────────────────────────────────────────────────

/// Sending half of a worker's stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Signals every receiver. Returns quietly if the worker is already gone.
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

/// Receiving half of a worker's stop signal.
pub type ShutdownRx = watch::Receiver<()>;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

/// Resolves once shutdown is signalled or the sender has been dropped.
pub async fn shutdown_requested(rx: &mut ShutdownRx) {
    let _ = rx.changed().await;
}

// ── backoff ───────────────────────────────────────────────────────────────────

/// Exponential retry delay driven by a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            factor: config.backoff_factor.max(1.0),
            current: initial,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown_ms = (self.current.as_millis() as f64 * f64::from(self.factor)).round() as u64;
        self.current = Duration::from_millis(grown_ms).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(&RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_factor: 2.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
