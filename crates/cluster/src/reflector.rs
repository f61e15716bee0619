//! The per-watch caching loop: one full list, then a long-lived incremental
//! watch, re-listing on errors. Keeps the keyed store current and pushes
//! ADD/UPDATE/DELETE notifications into the owning watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use manta_core::shutdown::ShutdownRx;
use manta_core::{EventKind, Object, WatchSpec};
use manta_store::Store;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, RawEvent, ResolvedResource};

const LIST_BACKOFF_START: Duration = Duration::from_secs(1);
const LIST_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Receives store transitions. For deletions the object is the last-known
/// state, already removed from the live store.
pub trait EventSink: Send + Sync {
    fn notify(&self, watch_index: usize, kind: EventKind, obj: &Object);
}

pub struct Reflector {
    watch_index: usize,
    name: String,
    spec: WatchSpec,
    resource: ResolvedResource,
    namespace: String,
    client: Arc<dyn ClusterClient>,
    store: Store,
    sink: Arc<dyn EventSink>,
    synced: AtomicBool,
}

impl Reflector {
    pub fn new(
        watch_index: usize,
        spec: WatchSpec,
        resource: ResolvedResource,
        namespace: String,
        client: Arc<dyn ClusterClient>,
        store: Store,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let name = format!(
            "{}/{} {} {}",
            namespace, resource.plural_name, spec.label_selector, spec.field_selector
        );
        Self { watch_index, name, spec, resource, namespace, client, store, sink, synced: AtomicBool::new(false) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// True once the initial list has completed at least once.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub async fn run(&self, mut shutdown: ShutdownRx) {
        let mut list_backoff = LIST_BACKOFF_START;
        loop {
            let list = loop {
                let attempt = tokio::select! {
                    _ = shutdown.changed() => return,
                    res = self.client.list(
                        &self.resource,
                        &self.namespace,
                        &self.spec.label_selector,
                        &self.spec.field_selector,
                        None,
                    ) => res,
                };
                match attempt {
                    Ok(list) => break list,
                    Err(e) => {
                        warn!(watch = %self.name, error = %e, "list failed; backing off");
                        counter!("reflector_list_errors_total", 1u64);
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(list_backoff) => {}
                        }
                        list_backoff = (list_backoff * 2).min(LIST_BACKOFF_MAX);
                    }
                }
            };
            list_backoff = LIST_BACKOFF_START;
            let mut rv = list.resource_version.clone();
            self.sync_store(list.items);
            self.synced.store(true, Ordering::SeqCst);
            counter!("reflector_relist_total", 1u64);

            let mut stream = match self
                .client
                .watch(
                    &self.resource,
                    &self.namespace,
                    &self.spec.label_selector,
                    &self.spec.field_selector,
                    &rv,
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(watch = %self.name, error = %e, "watch failed to open; re-listing");
                    counter!("reflector_watch_errors_total", 1u64);
                    continue;
                }
            };
            info!(watch = %self.name, resource_version = %rv, "watch stream opened");

            let resync_enabled = !self.spec.resync.is_zero();
            let idle = tokio::time::sleep(if resync_enabled {
                self.spec.resync
            } else {
                Duration::from_secs(24 * 60 * 60)
            });
            tokio::pin!(idle);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = idle.as_mut(), if resync_enabled => {
                        self.resync();
                        idle.as_mut().reset(Instant::now() + self.spec.resync);
                    }
                    event = stream.next() => {
                        if resync_enabled {
                            idle.as_mut().reset(Instant::now() + self.spec.resync);
                        }
                        match event {
                            Some(Ok(RawEvent::Added(obj))) | Some(Ok(RawEvent::Modified(obj))) => {
                                rv = obj.resource_version().to_string();
                                self.apply(obj);
                            }
                            Some(Ok(RawEvent::Deleted(obj))) => {
                                rv = obj.resource_version().to_string();
                                self.delete(obj);
                            }
                            Some(Ok(RawEvent::Bookmark(version))) => {
                                rv = version;
                            }
                            Some(Err(e)) => {
                                warn!(watch = %self.name, error = %e, last_rv = %rv, "watch stream error; re-listing");
                                counter!("reflector_watch_errors_total", 1u64);
                                break;
                            }
                            None => {
                                debug!(watch = %self.name, last_rv = %rv, "watch stream ended; re-listing");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reconcile a fresh list against the store: new keys become ADDs, keys
    /// with a changed resource version UPDATEs, keys no longer listed DELETEs.
    fn sync_store(&self, items: Vec<Object>) {
        let mut listed = Vec::with_capacity(items.len());
        for obj in items {
            let key = obj.key();
            listed.push(key.clone());
            match self.store.get(&key) {
                None => {
                    self.store.upsert(&key, obj.clone());
                    self.sink.notify(self.watch_index, EventKind::Add, &obj);
                }
                Some(prev) if prev.resource_version() != obj.resource_version() => {
                    self.store.upsert(&key, obj.clone());
                    self.sink.notify(self.watch_index, EventKind::Update, &obj);
                }
                Some(_) => {}
            }
        }
        for key in self.store.list_keys() {
            if !listed.contains(&key) {
                if let Some(prev) = self.store.remove(&key) {
                    self.sink.notify(self.watch_index, EventKind::Delete, &prev);
                }
            }
        }
    }

    fn apply(&self, obj: Object) {
        let key = obj.key();
        let prev = self.store.upsert(&key, obj.clone());
        let kind = if prev.is_none() { EventKind::Add } else { EventKind::Update };
        self.sink.notify(self.watch_index, kind, &obj);
    }

    fn delete(&self, obj: Object) {
        let key = obj.key();
        self.store.remove(&key);
        self.sink.notify(self.watch_index, EventKind::Delete, &obj);
    }

    /// Synthetic UPDATE per cached key, no network round trip.
    fn resync(&self) {
        debug!(watch = %self.name, "resync interval reached");
        counter!("reflector_resync_total", 1u64);
        for key in self.store.list_keys() {
            if let Some(obj) = self.store.get(&key) {
                self.sink.notify(self.watch_index, EventKind::Update, &obj);
            }
        }
    }
}
