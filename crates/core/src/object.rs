//! Opaque cluster objects.
//!
//! Objects flow through the pipeline as immutable JSON trees; they are decoded
//! only for the accessor fields below and re-encoded for transport to
//! webhooks and child handlers. Updates replace the whole value, so a cheap
//! `Arc` clone is all a consumer ever needs: the cached tree can never be
//! mutated through a handed-out copy.

use std::fmt;
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, PartialEq)]
pub struct Object(Arc<Value>);

impl Object {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// The raw JSON tree, for template evaluation and serialization.
    pub fn raw(&self) -> &Value {
        &self.0
    }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata")?.get(field)?.as_str()
    }

    pub fn api_version(&self) -> &str {
        self.0.get("apiVersion").and_then(Value::as_str).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.meta_str("name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    pub fn resource_version(&self) -> &str {
        self.meta_str("resourceVersion").unwrap_or("")
    }

    /// RFC-3339 creation timestamp, or empty when absent.
    pub fn creation_timestamp(&self) -> &str {
        self.meta_str("creationTimestamp").unwrap_or("")
    }

    /// RFC-3339 deletion timestamp, or empty while the object is live.
    pub fn deletion_timestamp(&self) -> &str {
        self.meta_str("deletionTimestamp").unwrap_or("")
    }

    /// Identity within one watch: `namespace/name`, or `name` when
    /// cluster-scoped.
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.name()),
            _ => self.name().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self.0.as_ref())
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({}.{}: {})", self.api_version(), self.kind(), self.key())
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Object::new)
    }
}

impl From<Value> for Object {
    fn from(value: Value) -> Self {
        Object::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Object {
        Object::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "a",
                "namespace": "ns1",
                "resourceVersion": "7",
                "creationTimestamp": "2024-01-01T00:00:00Z",
            },
            "data": {"k": "v"},
        }))
    }

    #[test]
    fn accessors() {
        let o = sample();
        assert_eq!(o.api_version(), "v1");
        assert_eq!(o.kind(), "ConfigMap");
        assert_eq!(o.key(), "ns1/a");
        assert_eq!(o.resource_version(), "7");
        assert_eq!(o.deletion_timestamp(), "");
    }

    #[test]
    fn cluster_scoped_key_is_bare_name() {
        let o = Object::new(json!({"metadata": {"name": "node-1"}}));
        assert_eq!(o.key(), "node-1");
    }

    #[test]
    fn serde_round_trip_preserves_tree() {
        let o = sample();
        let text = o.to_json().unwrap();
        let back: Object = serde_json::from_str(&text).unwrap();
        assert_eq!(back, o);
    }
}
