use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::models::k8s::{EventAction, OpaqueResource, PodRecord, ResourceEvent, ResourceKey};

/// A change notification emitted by [`ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted(ResourceKey),
    Deleted(ResourceKey),
    /// Every record of the namespace was dropped.
    Evicted(String),
    /// The namespace's connection went down; its records are now stale.
    Stale(String),
}

impl StoreChange {
    pub fn namespace(&self) -> &str {
        match self {
            StoreChange::Upserted(key) | StoreChange::Deleted(key) => &key.namespace,
            StoreChange::Evicted(ns) => ns,
            StoreChange::Stale(namespace) => namespace,
        }
    }
}

#[derive(Default)]
struct Inner {
    pods: HashMap<ResourceKey, PodRecord>,
    opaque: HashMap<ResourceKey, OpaqueResource>,
    next_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<StoreChange>>,
}

impl Inner {
    fn notify(&mut self, change: StoreChange) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn upsert_pod(&mut self, event: &ResourceEvent) -> bool {
        let key = event.key();
        let first_seen = match self.pods.get(&key) {
            Some(existing) if existing.matches(event) => return false,
            Some(existing) => existing.first_seen,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };

        let record = PodRecord {
            name: event.name.clone(),
            namespace: event.namespace.clone(),
            containers: event.containers.clone(),
            status: event.status.clone(),
            labels: event.labels.clone(),
            owner_references: event.owner_references.clone(),
            creation_timestamp: event.creation_timestamp,
            image: event.image.clone(),
            first_seen,
            last_updated: Utc::now(),
            stale: false,
        };
        self.pods.insert(key, record);
        true
    }

    fn upsert_opaque(&mut self, event: &ResourceEvent) -> bool {
        let key = event.key();
        if let Some(existing) = self.opaque.get(&key) {
            if existing.raw == event.raw {
                return false;
            }
        }
        self.opaque.insert(
            key.clone(),
            OpaqueResource {
                key,
                raw: event.raw.clone(),
                last_updated: Utc::now(),
            },
        );
        true
    }

    fn mark_stale(&mut self, namespace: &str) -> bool {
        let mut changed = false;
        for pod in self.pods.values_mut().filter(|p| p.namespace == namespace && !p.stale) {
            pod.stale = true;
            changed = true;
        }
        changed
    }
}

/// In-memory cache of the latest state of every watched resource.
///
/// All mutations go through one lock, so events for a key are applied in the
/// order their writers call in. Change notifications are queued to subscribers
/// while the lock is held and therefore arrive in application order.
#[derive(Clone, Default)]
pub struct ResourceStore {
    inner: Arc<Mutex<Inner>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an event according to its action.
    pub fn apply(&self, event: ResourceEvent) {
        match event.action {
            EventAction::Upsert => self.upsert(event),
            EventAction::Delete => {
                self.delete(&event.key());
            }
        }
    }

    /// Inserts or replaces the record for the event's key.
    ///
    /// An event equal to the stored record is a no-op: nothing is replaced and
    /// no notification is sent.
    pub fn upsert(&self, event: ResourceEvent) {
        let mut inner = self.lock();
        let changed = if event.key().is_pod() {
            inner.upsert_pod(&event)
        } else {
            inner.upsert_opaque(&event)
        };

        if changed {
            inner.notify(StoreChange::Upserted(event.key()));
        }
    }

    /// Removes a record. Returns whether it existed.
    pub fn delete(&self, key: &ResourceKey) -> bool {
        let mut inner = self.lock();
        let existed = inner.pods.remove(key).is_some() || inner.opaque.remove(key).is_some();
        if existed {
            inner.notify(StoreChange::Deleted(key.clone()));
        }
        existed
    }

    /// Drops every record of `namespace`. Returns the number removed.
    pub fn evict_namespace(&self, namespace: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.pods.len() + inner.opaque.len();
        inner.pods.retain(|key, _| key.namespace != namespace);
        inner.opaque.retain(|key, _| key.namespace != namespace);
        let removed = before - (inner.pods.len() + inner.opaque.len());

        inner.notify(StoreChange::Evicted(namespace.to_string()));
        log::info!("store: evicted {removed} record(s) of namespace {namespace:?}");
        removed
    }

    /// Flags the namespace's pods as stale while its connection is down.
    /// Records are kept until the connection comes back, which replaces
    /// them with a fresh snapshot, or until the namespace is unwatched.
    pub fn mark_stale(&self, namespace: &str) {
        let mut inner = self.lock();
        if inner.mark_stale(namespace) {
            inner.notify(StoreChange::Stale(namespace.to_string()));
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<PodRecord> {
        self.lock().pods.get(key).cloned()
    }

    pub fn get_opaque(&self, key: &ResourceKey) -> Option<OpaqueResource> {
        self.lock().opaque.get(key).cloned()
    }

    /// Pods of a namespace, sorted by name.
    pub fn list(&self, namespace: &str) -> Vec<PodRecord> {
        let mut pods: Vec<PodRecord> = self
            .lock()
            .pods
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    /// Namespaces that currently hold at least one record.
    pub fn namespaces(&self) -> Vec<String> {
        let inner = self.lock();
        let mut namespaces: Vec<String> = inner
            .pods
            .keys()
            .chain(inner.opaque.keys())
            .map(|k| k.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// Registers a change observer. Dropping the receiver unsubscribes.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}
