//! The event-processing engine.
//!
//! One reflector per registered watch feeds the shared deduplicating queue;
//! exactly one worker consumes it. Presence is re-read at dispatch time, so
//! coalesced notifications always deliver the latest cached state, and
//! deletions are delivered from the tombstone map after the live entry is
//! gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use manta_cluster::{ClusterClient, ClusterError, EventSink, Reflector};
use manta_core::shutdown::{self, ShutdownRx};
use manta_core::{EventKind, EventRef, Object, WatchSpec};
use manta_store::{default_limiter, IndexFn, Store, WorkQueue};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

/// Dispatch target for one event. The object is a private copy; mutating it
/// never touches the cache.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: EventKind, obj: Object, num_retries: u32) -> anyhow::Result<()>;
}

/// Fallback handler when nothing else is configured: one log line per event.
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, event: EventKind, obj: Object, _num_retries: u32) -> anyhow::Result<()> {
        info!(
            "{} {}.{}: {}/{}",
            event,
            obj.api_version(),
            obj.kind(),
            obj.namespace().unwrap_or(""),
            obj.name()
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// -1 for unlimited.
    pub max_retries: i64,
    pub retries_base_delay: Duration,
    pub retries_max_delay: Duration,
    pub limit_rate: f64,
    pub limit_bursts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_retries: 15,
            retries_base_delay: Duration::from_millis(5),
            retries_max_delay: Duration::from_secs(1000),
            limit_rate: f64::INFINITY,
            limit_bursts: u32::MAX,
        }
    }
}

/// Read access to the cached state, for the HTTP query surface.
pub trait CacheView: Send + Sync {
    fn active(&self) -> bool;
    fn store(&self, watch_index: usize) -> Option<Store>;
}

/// Queue plus tombstones: the state shared between the reflector
/// notification path and the worker.
struct EngineShared {
    queue: WorkQueue<EventRef>,
    tombstones: Mutex<FxHashMap<(usize, String), Object>>,
}

impl EventSink for EngineShared {
    fn notify(&self, watch_index: usize, kind: EventKind, obj: &Object) {
        let key = obj.key();
        if kind == EventKind::Delete {
            // Recorded before the enqueue so the worker can always find the
            // last-known state once the live entry is gone.
            self.tombstones
                .lock()
                .unwrap()
                .insert((watch_index, key.clone()), obj.clone());
        }
        self.queue.add(EventRef { watch_index, key, kind });
    }
}

pub struct Engine {
    client: Arc<dyn ClusterClient>,
    shared: Arc<EngineShared>,
    watches: Vec<Arc<Reflector>>,
    handler: Arc<dyn Handler>,
    indexers: HashMap<String, IndexFn>,
    opts: EngineOptions,
    active: AtomicBool,
}

impl Engine {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        handler: Arc<dyn Handler>,
        indexers: HashMap<String, IndexFn>,
        opts: EngineOptions,
    ) -> Self {
        let limiter = default_limiter(
            opts.retries_base_delay,
            opts.retries_max_delay,
            opts.limit_rate,
            opts.limit_bursts,
        );
        Self {
            client,
            shared: Arc::new(EngineShared {
                queue: WorkQueue::new(Box::new(limiter)),
                tombstones: Mutex::new(FxHashMap::default()),
            }),
            watches: Vec::new(),
            handler,
            indexers,
            opts,
            active: AtomicBool::new(false),
        }
    }

    /// Register a watch; the returned index is its routing key. Cluster-scoped
    /// resources ignore the requested namespace.
    pub async fn add_watch(&mut self, spec: WatchSpec) -> Result<usize, ClusterError> {
        let resource = self.client.resolve_resource(&spec.api_version, &spec.kind).await?;
        let namespace = if resource.namespaced { spec.namespace.clone() } else { String::new() };
        let watch_index = self.watches.len();
        let reflector = Arc::new(Reflector::new(
            watch_index,
            spec,
            resource,
            namespace,
            self.client.clone(),
            Store::new(self.indexers.clone()),
            self.shared.clone(),
        ));
        self.watches.push(reflector);
        Ok(watch_index)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn pending_tombstones(&self) -> usize {
        self.shared.tombstones.lock().unwrap().len()
    }

    /// Runs until `shutdown` fires: reflectors first, then once every cache
    /// has synced, the single worker. Shutdown is ordered: reflectors stop,
    /// the queue drains, the worker exits, then `run` returns.
    pub async fn run(&self, mut shutdown: ShutdownRx) -> anyhow::Result<()> {
        if self.watches.is_empty() {
            bail!("no watches configured");
        }
        let (reflector_tx, _keepalive) = shutdown::channel();
        let mut reflector_handles = Vec::with_capacity(self.watches.len());
        for reflector in &self.watches {
            info!(watch = %reflector.name(), "watching");
            let rx = reflector_tx.subscribe();
            let reflector = reflector.clone();
            reflector_handles.push(tokio::spawn(async move { reflector.run(rx).await }));
        }

        for reflector in &self.watches {
            while !reflector.has_synced() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        reflector_tx.shutdown();
                        for handle in reflector_handles {
                            let _ = handle.await;
                        }
                        return Ok(());
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }
        self.active.store(true, Ordering::SeqCst);
        info!("caches synced; engine active");

        let worker = {
            let shared = self.shared.clone();
            let stores: Vec<Store> = self.watches.iter().map(|w| w.store()).collect();
            let handler = self.handler.clone();
            let max_retries = self.opts.max_retries;
            tokio::spawn(async move { worker_loop(shared, stores, handler, max_retries).await })
        };

        let _ = shutdown.changed().await;

        // Stop the reflectors before draining so no new items arrive.
        reflector_tx.shutdown();
        for handle in reflector_handles {
            let _ = handle.await;
        }
        self.shared.queue.shutdown();
        let _ = worker.await;
        self.active.store(false, Ordering::SeqCst);
        info!("engine stopped");
        Ok(())
    }
}

impl CacheView for Engine {
    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn store(&self, watch_index: usize) -> Option<Store> {
        self.watches.get(watch_index).map(|w| w.store())
    }
}

async fn worker_loop(
    shared: Arc<EngineShared>,
    stores: Vec<Store>,
    handler: Arc<dyn Handler>,
    max_retries: i64,
) {
    while let Some(item) = shared.queue.get().await {
        process_item(&shared, &stores, handler.as_ref(), max_retries, &item).await;
        shared.queue.done(&item);
    }
}

async fn process_item(
    shared: &EngineShared,
    stores: &[Store],
    handler: &dyn Handler,
    max_retries: i64,
    item: &EventRef,
) {
    let num_retries = shared.queue.num_requeues(item);
    let current = stores.get(item.watch_index).and_then(|s| s.get(&item.key));
    let tomb_key = (item.watch_index, item.key.clone());
    let (kind, obj) = match &current {
        Some(obj) => (item.kind, obj.clone()),
        None => {
            let tombstone = shared.tombstones.lock().unwrap().get(&tomb_key).cloned();
            match tombstone {
                // A late-arriving delete coalesces into a DELETE carrying the
                // last-known state.
                Some(obj) => (EventKind::Delete, obj),
                None => {
                    // Stale reference: the key vanished without a tombstone.
                    shared.queue.forget(item);
                    return;
                }
            }
        }
    };
    if let Err(e) = handler.handle(kind, obj, num_retries).await {
        counter!("engine_handler_failures_total", 1u64);
        warn!(
            item = %item,
            retries = num_retries,
            max_retries,
            error = %e,
            "handler failed"
        );
        if max_retries < 0 || i64::from(num_retries) < max_retries {
            shared.queue.add_rate_limited(item.clone());
            return;
        }
        warn!(item = %item, "retries exhausted; dropping event");
    }
    if current.is_none() {
        shared.tombstones.lock().unwrap().remove(&tomb_key);
    }
    shared.queue.forget(item);
}
