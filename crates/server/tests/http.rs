#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use manta_core::Object;
use manta_engine::CacheView;
use manta_server::{router, ServerConfig};
use manta_store::{IndexFn, Store};
use serde_json::{json, Value};
use tower::ServiceExt;

struct StubView {
    active: bool,
    stores: Vec<Store>,
}

impl CacheView for StubView {
    fn active(&self) -> bool {
        self.active
    }

    fn store(&self, watch_index: usize) -> Option<Store> {
        self.stores.get(watch_index).cloned()
    }
}

fn pod(name: &str, node: &str) -> Object {
    Object::new(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": "ns1", "resourceVersion": "1"},
        "spec": {"nodeName": node},
    }))
}

fn seeded_view(active: bool) -> Arc<StubView> {
    let by_node: IndexFn = Arc::new(|obj: &Object| {
        obj.raw()
            .pointer("/spec/nodeName")
            .and_then(|v| v.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default()
    });
    let store = Store::new(HashMap::from([("by-node".to_string(), by_node)]));
    store.upsert("ns1/p1", pod("p1", "node-a"));
    store.upsert("ns1/p2", pod("p2", "node-a"));
    store.upsert("ns1/p3", pod("p3", "node-b"));
    Arc::new(StubView { active, stores: vec![store] })
}

async fn get_json(view: Arc<StubView>, uri: &str) -> (StatusCode, Value) {
    let app = router(&ServerConfig::default(), view, None);
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reflects_engine_state() {
    let (status, body) = get_json(seeded_view(true), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "UP"}));

    let (status, body) = get_json(seeded_view(false), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({"status": "DOWN"}));
}

#[tokio::test]
async fn key_lookup_returns_one_or_zero_items() {
    let (status, body) = get_json(seeded_view(true), "/index?key=ns1/p1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["metadata"]["name"], "p1");

    let (_, body) = get_json(seeded_view(true), "/index?key=ns1/absent").await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["items"], json!([]));
}

#[tokio::test]
async fn list_and_keys_flags() {
    let (_, body) = get_json(seeded_view(true), "/index?list").await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 3);

    let (_, body) = get_json(seeded_view(true), "/index?keys").await;
    assert_eq!(body["keys"], json!(["ns1/p1", "ns1/p2", "ns1/p3"]));
}

#[tokio::test]
async fn pagination_is_a_contiguous_slice_with_true_total() {
    let (_, full) = get_json(seeded_view(true), "/index?list&offset=0&limit=200").await;
    let all = full["items"].as_array().unwrap().clone();

    let (_, body) = get_json(seeded_view(true), "/index?list&offset=1&limit=1").await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().as_slice(), &all[1..2]);

    // Out-of-range and degenerate paging keep the true total.
    for uri in ["/index?list&offset=3", "/index?list&offset=-1", "/index?list&limit=0"] {
        let (_, body) = get_json(seeded_view(true), uri).await;
        assert_eq!(body["total"], 3, "{uri}");
        assert_eq!(body["items"], json!([]), "{uri}");
    }
}

#[tokio::test]
async fn by_index_queries() {
    let (_, body) = get_json(seeded_view(true), "/index/by-node?key=node-a").await;
    assert_eq!(body["total"], 2);
    let names: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["metadata"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["p1", "p2"]);

    let (_, body) = get_json(seeded_view(true), "/index/by-node?keys").await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["keys"], json!(["node-a", "node-b"]));

    let (_, body) = get_json(seeded_view(true), "/index/").await;
    assert_eq!(body["indexes"], json!(["by-node"]));
}

#[tokio::test]
async fn errors_become_500_with_error_envelope() {
    let (status, body) = get_json(seeded_view(true), "/index?watch=7&list").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "watch 7 not exists"}));

    let (status, body) = get_json(seeded_view(true), "/index/no-such-index?key=x").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("no-such-index"));
}

#[tokio::test]
async fn bad_numeric_params_fall_back_to_defaults() {
    let (status, body) = get_json(seeded_view(true), "/index?list&watch=abc&offset=abc&limit=abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 3);
}
