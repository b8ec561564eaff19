use crate::commands::Dispatcher;
use crate::error::TelemetryResult;
use crate::models::k8s::StreamTarget;
use crate::streams::{LogCancelHandle, LogSubscription};

impl Dispatcher {
    /// Tails a container's log, calling `on_line` for every line.
    ///
    /// Subscribers of the same container share one stream. `on_line` runs on
    /// a task of its own, in line order; it stops being called once the
    /// returned handle is cancelled and lines already queued are delivered.
    pub fn subscribe_log<F>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        mut on_line: F,
    ) -> TelemetryResult<LogCancelHandle>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut subscription = self.stream_log(namespace, pod, container)?;
        let handle = subscription.cancel_handle();

        tokio::spawn(async move {
            while let Some(line) = subscription.next_line().await {
                on_line(line);
            }
        });

        Ok(handle)
    }

    /// Like [`Dispatcher::subscribe_log`] but hands back the subscription
    /// itself for callers that prefer to pull lines.
    pub fn stream_log(&self, namespace: &str, pod: &str, container: &str) -> TelemetryResult<LogSubscription> {
        self.ensure_running()?;
        Ok(self
            .streams
            .subscribe_log(StreamTarget::new(namespace, pod, container)))
    }

    pub fn log_stream_count(&self) -> usize {
        self.streams.log_stream_count()
    }
}
