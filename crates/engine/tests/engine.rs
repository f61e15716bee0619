#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use manta_cluster::{ClusterClient, MockClusterClient};
use manta_core::shutdown::{self, ShutdownTx};
use manta_core::{EventKind, Object, WatchSpec};
use manta_engine::{CacheView, Engine, EngineOptions, Handler};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

fn cm(name: &str, rv: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "ns1", "resourceVersion": rv},
    })
}

/// Handshake that parks the worker inside an invocation: the handler signals
/// `entered` and waits for a `release` permit before recording the call.
struct Gate {
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self { entered: Semaphore::new(0), release: Semaphore::new(0) })
    }

    /// Waits until the worker is parked inside the next invocation.
    async fn entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    fn release(&self) {
        self.release.add_permits(1);
    }
}

/// Records every invocation; optionally fails the first N calls.
struct RecordingHandler {
    calls: Mutex<Vec<(EventKind, String, String, u32)>>,
    fail_first: AtomicI64,
    gate: Option<Arc<Gate>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), fail_first: AtomicI64::new(0), gate: None })
    }

    fn failing(times: i64) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_first: AtomicI64::new(times),
            gate: None,
        })
    }

    fn gated(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_first: AtomicI64::new(0),
            gate: Some(gate),
        })
    }

    fn calls(&self) -> Vec<(EventKind, String, String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    async fn wait_calls(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.calls.lock().unwrap().len() < n {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {n} calls");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, event: EventKind, obj: Object, num_retries: u32) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.entered.add_permits(1);
            gate.release.acquire().await.unwrap().forget();
        }
        self.calls.lock().unwrap().push((
            event,
            obj.key(),
            obj.resource_version().to_string(),
            num_retries,
        ));
        if self.fail_first.fetch_sub(1, Ordering::SeqCst) > 0 {
            anyhow::bail!("induced failure");
        }
        Ok(())
    }
}

async fn start_engine(
    mock: &MockClusterClient,
    handler: Arc<dyn Handler>,
    opts: EngineOptions,
) -> (Arc<Engine>, ShutdownTx, JoinHandle<anyhow::Result<()>>) {
    let client: Arc<dyn ClusterClient> = Arc::new(mock.clone());
    let mut engine = Engine::new(client, handler, HashMap::new(), opts);
    let mut spec = WatchSpec::new("v1", "ConfigMap");
    spec.namespace = "ns1".into();
    engine.add_watch(spec).await.unwrap();
    let engine = Arc::new(engine);
    let (tx, rx) = shutdown::channel();
    let handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };
    while !engine.active() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    (engine, tx, handle)
}

fn fast_retries(max_retries: i64) -> EngineOptions {
    EngineOptions {
        max_retries,
        retries_base_delay: Duration::from_millis(1),
        retries_max_delay: Duration::from_millis(8),
        ..EngineOptions::default()
    }
}

#[tokio::test]
async fn create_update_delete_pass_through() {
    let mock = MockClusterClient::new("ns1");
    let handler = RecordingHandler::new();
    let (_engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(15)).await;

    mock.push_add(cm("a", "1"));
    handler.wait_calls(1).await;
    mock.push_update(cm("a", "2"));
    handler.wait_calls(2).await;
    mock.push_delete("ns1/a");
    handler.wait_calls(3).await;

    assert_eq!(
        handler.calls(),
        vec![
            (EventKind::Add, "ns1/a".to_string(), "1".to_string(), 0),
            (EventKind::Update, "ns1/a".to_string(), "2".to_string(), 0),
            // The delete delivers the tombstoned final state.
            (EventKind::Delete, "ns1/a".to_string(), "2".to_string(), 0),
        ]
    );

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn initial_list_delivers_adds() {
    let mock = MockClusterClient::new("ns1");
    mock.seed(cm("a", "1"));
    mock.seed(cm("b", "2"));
    let handler = RecordingHandler::new();
    let (_engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(15)).await;

    handler.wait_calls(2).await;
    let calls = handler.calls();
    assert!(calls.iter().all(|(kind, _, _, _)| *kind == EventKind::Add));

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn coalesced_updates_deliver_latest_state() {
    let mock = MockClusterClient::new("ns1");
    mock.seed(cm("a", "1"));
    let gate = Gate::new();
    let handler = RecordingHandler::gated(gate.clone());
    let (engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(15)).await;
    let store = engine.store(0).unwrap();

    // Let the seeded add through.
    gate.entered().await;
    gate.release();
    handler.wait_calls(1).await;

    // Park the worker inside the first update, then land two more while the
    // item is in flight: they coalesce into a single re-dispatch.
    mock.push_update(cm("a", "2"));
    gate.entered().await;
    mock.push_update(cm("a", "3"));
    mock.push_update(cm("a", "4"));
    // Both updates must be cached before the worker is released, so the
    // re-dispatch is guaranteed to observe the final state.
    while store.get("ns1/a").map(|o| o.resource_version().to_string()).as_deref() != Some("4") {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    gate.release();
    handler.wait_calls(2).await;

    gate.entered().await;
    gate.release();
    handler.wait_calls(3).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 3, "three rapid updates must collapse to two dispatches: {calls:?}");
    assert_eq!(calls[1], (EventKind::Update, "ns1/a".to_string(), "2".to_string(), 0));
    // The re-dispatch reads the store at dispatch time: rv 3 is never seen.
    assert_eq!(calls[2], (EventKind::Update, "ns1/a".to_string(), "4".to_string(), 0));

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn delete_behind_queued_update_delivers_tombstone() {
    let mock = MockClusterClient::new("ns1");
    mock.seed(cm("a", "1"));
    let gate = Gate::new();
    let handler = RecordingHandler::gated(gate.clone());
    let (engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(15)).await;
    let store = engine.store(0).unwrap();

    gate.entered().await;
    gate.release();
    handler.wait_calls(1).await;

    // Park the worker in the update, then delete: the queued delete ref must
    // deliver the tombstoned final state once the live entry is gone.
    mock.push_update(cm("a", "2"));
    gate.entered().await;
    mock.push_delete("ns1/a");
    while store.get("ns1/a").is_some() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    gate.release();
    handler.wait_calls(2).await;

    // Update in-flight copy delivered rv 2; the queued delete ref now finds
    // the tombstone.
    gate.entered().await;
    gate.release();
    handler.wait_calls(3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = handler.calls();
    let last = calls.last().unwrap();
    assert_eq!(last.0, EventKind::Delete);
    assert_eq!(last.2, "2", "delete must carry the final resource version");
    assert_eq!(engine.pending_tombstones(), 0, "tombstone must be cleared after delivery");

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn retries_then_succeeds_with_counted_attempts() {
    let mock = MockClusterClient::new("ns1");
    let handler = RecordingHandler::failing(2);
    let (_engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(5)).await;

    mock.push_add(cm("a", "1"));
    handler.wait_calls(3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 3, "two failures then success: {calls:?}");
    let retries: Vec<u32> = calls.iter().map(|c| c.3).collect();
    assert_eq!(retries, vec![0, 1, 2]);

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn retry_bound_is_max_retries_plus_one_attempts() {
    let mock = MockClusterClient::new("ns1");
    let handler = RecordingHandler::failing(i64::MAX);
    let (_engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(2)).await;

    mock.push_add(cm("a", "1"));
    handler.wait_calls(3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls().len(), 3, "max_retries=2 means exactly 3 attempts");

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_delete_clears_tombstone() {
    let mock = MockClusterClient::new("ns1");
    mock.seed(cm("a", "1"));
    let handler = RecordingHandler::failing(i64::MAX);
    let (engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(1)).await;

    // The seeded add burns its two attempts, then the delete burns two more.
    handler.wait_calls(2).await;
    mock.push_delete("ns1/a");
    handler.wait_calls(4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[2..].iter().all(|c| c.0 == EventKind::Delete));
    assert_eq!(engine.pending_tombstones(), 0);

    tx.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_dispatch_and_returns() {
    let mock = MockClusterClient::new("ns1");
    let handler = RecordingHandler::new();
    let (engine, tx, handle) = start_engine(&mock, handler.clone(), fast_retries(15)).await;

    mock.push_add(cm("a", "1"));
    handler.wait_calls(1).await;

    tx.shutdown();
    handle.await.unwrap().unwrap();
    assert!(!engine.active(), "engine must report inactive after run returns");
}
