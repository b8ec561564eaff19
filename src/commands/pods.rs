use tokio::sync::mpsc;

use crate::commands::Dispatcher;
use crate::connection::{NamespaceStatus, WatchHandle};
use crate::error::TelemetryResult;
use crate::jobs;
use crate::models::k8s::{InferredJob, PodRecord, ResourceKey};
use crate::store::StoreChange;

impl Dispatcher {
    /// Starts (or joins) the watch on `namespace`.
    ///
    /// Returns immediately; connection progress is visible through
    /// [`Dispatcher::namespace_status`].
    pub async fn watch_namespace(&self, namespace: &str) -> TelemetryResult<WatchHandle> {
        self.ensure_running()?;
        Ok(self.connections.watch(namespace).await)
    }

    /// Releases one watch on `namespace`. When it was the last, the
    /// connection is closed and the namespace's pods are dropped.
    /// Unwatching a namespace nobody watches does nothing.
    pub async fn unwatch_namespace(&self, namespace: &str) {
        self.connections.release(namespace).await;
    }

    /// Same as [`Dispatcher::unwatch_namespace`] for a specific handle.
    pub async fn unwatch(&self, handle: WatchHandle) {
        self.connections.unwatch(handle).await;
    }

    pub async fn namespace_status(&self, namespace: &str) -> Option<NamespaceStatus> {
        self.connections.status(namespace).await
    }

    pub async fn watched_namespaces(&self) -> Vec<String> {
        self.connections.watched().await
    }

    /// Pods of `namespace`, sorted by name.
    pub fn list_pods(&self, namespace: &str) -> Vec<PodRecord> {
        self.store.list(namespace)
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<PodRecord> {
        self.store.get(&ResourceKey::pod(namespace, name))
    }

    /// Jobs derived from the namespace's current pods, newest first.
    pub fn list_jobs(&self, namespace: &str) -> Vec<InferredJob> {
        let pods = self.store.list(namespace);
        jobs::infer(&pods)
    }

    /// Feed of store changes across all namespaces.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<StoreChange> {
        self.store.subscribe_changes()
    }
}
