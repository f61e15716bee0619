//! In-memory `ClusterClient` for tests: a single mutable universe of objects
//! with a broadcast watch feed.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use manta_core::Object;
use tokio::sync::broadcast;

use crate::client::{
    ClusterClient, ClusterError, EventStream, ObjectList, RawEvent, ResolvedResource,
};

struct MockState {
    items: Vec<Object>,
    resource_version: u64,
    events: broadcast::Sender<RawEvent>,
    /// Subscription opened at list time so nothing pushed between a list and
    /// the following watch call is lost.
    pending: Option<broadcast::Receiver<RawEvent>>,
}

/// Mock control plane. Clones share the same state, so a test can keep one
/// handle and give another to the engine.
#[derive(Clone)]
pub struct MockClusterClient {
    namespace: String,
    state: Arc<Mutex<MockState>>,
}

impl MockClusterClient {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(MockState {
                items: Vec::new(),
                resource_version: 0,
                events,
                pending: None,
            })),
        }
    }

    /// Seed an object without emitting a watch event; visible to the next list.
    pub fn seed(&self, value: serde_json::Value) {
        let obj = Object::new(value);
        let mut state = self.state.lock().unwrap();
        state.resource_version += 1;
        upsert(&mut state.items, obj);
    }

    pub fn push_add(&self, value: serde_json::Value) {
        let obj = Object::new(value);
        let mut state = self.state.lock().unwrap();
        state.resource_version += 1;
        upsert(&mut state.items, obj.clone());
        let _ = state.events.send(RawEvent::Added(obj));
    }

    pub fn push_update(&self, value: serde_json::Value) {
        let obj = Object::new(value);
        let mut state = self.state.lock().unwrap();
        state.resource_version += 1;
        upsert(&mut state.items, obj.clone());
        let _ = state.events.send(RawEvent::Modified(obj));
    }

    /// Delete by object key; the watch event carries the last-known state.
    pub fn push_delete(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.items.iter().position(|o| o.key() == key) {
            let obj = state.items.remove(pos);
            state.resource_version += 1;
            let _ = state.events.send(RawEvent::Deleted(obj));
        }
    }

    pub fn push_bookmark(&self) {
        let state = self.state.lock().unwrap();
        let _ = state.events.send(RawEvent::Bookmark(state.resource_version.to_string()));
    }
}

fn upsert(items: &mut Vec<Object>, obj: Object) {
    let key = obj.key();
    match items.iter().position(|o| o.key() == key) {
        Some(pos) => items[pos] = obj,
        None => items.push(obj),
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn default_namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn resolve_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResolvedResource, ClusterError> {
        Ok(ResolvedResource {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural_name: format!("{}s", kind.to_lowercase()),
            namespaced: true,
        })
    }

    async fn list(
        &self,
        _resource: &ResolvedResource,
        namespace: &str,
        _label_selector: &str,
        _field_selector: &str,
        _resource_version: Option<&str>,
    ) -> Result<ObjectList, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let items = state
            .items
            .iter()
            .filter(|o| namespace.is_empty() || o.namespace() == Some(namespace))
            .cloned()
            .collect();
        state.pending = Some(state.events.subscribe());
        Ok(ObjectList { items, resource_version: state.resource_version.to_string() })
    }

    async fn watch(
        &self,
        _resource: &ResolvedResource,
        _namespace: &str,
        _label_selector: &str,
        _field_selector: &str,
        _resource_version: &str,
    ) -> Result<EventStream, ClusterError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            state.pending.take().unwrap_or_else(|| state.events.subscribe())
        };
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(ClusterError::Api(format!("watch lagged by {n}"))), rx))
                }
            }
        })
        .boxed())
    }
}
