//! Lease lock backends.
//!
//! The leader record travels either as the spec of a coordination `Lease`
//! object or as the `control-plane.alpha.kubernetes.io/leader` annotation on
//! an `Endpoints`/`ConfigMap` object, matching what other control-plane
//! components write.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("lease lock: {0}")]
    Api(String),
    #[error("unknown lock kind {0}, expected endpoints, configmaps or leases")]
    UnknownKind(String),
}

/// The record competing replicas read and write. Field names follow the
/// annotation format other control planes use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    #[serde(default)]
    pub holder_identity: String,
    #[serde(default)]
    pub lease_duration_seconds: i64,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leader_transitions: i32,
}

impl LeaderRecord {
    /// An unheld record, as seen on a lock object that exists but carries no
    /// leader yet.
    pub fn vacant() -> Self {
        Self {
            holder_identity: String::new(),
            lease_duration_seconds: 0,
            acquire_time: None,
            renew_time: None,
            leader_transitions: 0,
        }
    }
}

#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// `None` means the lock object does not exist yet.
    async fn get(&self) -> Result<Option<LeaderRecord>, LeaderError>;
    /// Fails when the object already exists; that is the mutual exclusion.
    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderError>;
    async fn update(&self, record: &LeaderRecord) -> Result<(), LeaderError>;
    fn describe(&self) -> String;
}

/// Lock for tests and single-process setups.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    state: Arc<Mutex<Option<LeaderRecord>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for InMemoryLock {
    async fn get(&self) -> Result<Option<LeaderRecord>, LeaderError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(LeaderError::Api("already exists".into()));
        }
        *state = Some(record.clone());
        Ok(())
    }

    async fn update(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        *self.state.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Lock over a coordination `Lease` object, record in the spec fields.
pub struct LeaseObjectLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl LeaseObjectLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn spec_from(record: &LeaderRecord) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(record.lease_duration_seconds as i32),
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            lease_transitions: Some(record.leader_transitions),
            ..LeaseSpec::default()
        }
    }
}

#[async_trait]
impl LeaseLock for LeaseObjectLock {
    async fn get(&self) -> Result<Option<LeaderRecord>, LeaderError> {
        let lease = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| LeaderError::Api(e.to_string()))?;
        Ok(lease.map(|lease| {
            let spec = lease.spec.unwrap_or_default();
            LeaderRecord {
                holder_identity: spec.holder_identity.unwrap_or_default(),
                lease_duration_seconds: spec.lease_duration_seconds.unwrap_or(0).into(),
                acquire_time: spec.acquire_time.map(|t| t.0),
                renew_time: spec.renew_time.map(|t| t.0),
                leader_transitions: spec.lease_transitions.unwrap_or(0),
            }
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        let mut lease = Lease::default();
        lease.meta_mut().name = Some(self.name.clone());
        lease.spec = Some(Self::spec_from(record));
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map(|_| ())
            .map_err(|e| LeaderError::Api(e.to_string()))
    }

    async fn update(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        let Some(mut lease) = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| LeaderError::Api(e.to_string()))?
        else {
            return self.create(record).await;
        };
        lease.spec = Some(Self::spec_from(record));
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map(|_| ())
            .map_err(|e| LeaderError::Api(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("leases/{}/{}", self.namespace, self.name)
    }
}

/// Lock carrying the record as an annotation on an arbitrary namespaced
/// object (`Endpoints` or `ConfigMap`).
pub struct AnnotationLock<K> {
    api: Api<K>,
    kind: &'static str,
    namespace: String,
    name: String,
}

impl<K> AnnotationLock<K>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Default,
{
    pub fn new(client: Client, kind: &'static str, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<K> LeaseLock for AnnotationLock<K>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Default
        + Send
        + Sync,
{
    async fn get(&self) -> Result<Option<LeaderRecord>, LeaderError> {
        let obj = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| LeaderError::Api(e.to_string()))?;
        let Some(obj) = obj else { return Ok(None) };
        match obj.annotations().get(LEADER_ANNOTATION) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| LeaderError::Api(format!("parse leader annotation: {e}"))),
            None => Ok(Some(LeaderRecord::vacant())),
        }
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        let raw = serde_json::to_string(record).map_err(|e| LeaderError::Api(e.to_string()))?;
        let mut obj = K::default();
        obj.meta_mut().name = Some(self.name.clone());
        obj.annotations_mut().insert(LEADER_ANNOTATION.to_string(), raw);
        self.api
            .create(&PostParams::default(), &obj)
            .await
            .map(|_| ())
            .map_err(|e| LeaderError::Api(e.to_string()))
    }

    async fn update(&self, record: &LeaderRecord) -> Result<(), LeaderError> {
        let Some(mut obj) = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| LeaderError::Api(e.to_string()))?
        else {
            return self.create(record).await;
        };
        let raw = serde_json::to_string(record).map_err(|e| LeaderError::Api(e.to_string()))?;
        obj.annotations_mut().insert(LEADER_ANNOTATION.to_string(), raw);
        self.api
            .replace(&self.name, &PostParams::default(), &obj)
            .await
            .map(|_| ())
            .map_err(|e| LeaderError::Api(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Builds the lock named by `[kind/]name` syntax; the default kind is
/// `endpoints`.
pub fn new_kube_lock(
    client: Client,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<Arc<dyn LeaseLock>, LeaderError> {
    match kind {
        "" | "endpoints" => {
            Ok(Arc::new(AnnotationLock::<Endpoints>::new(client, "endpoints", namespace, name)))
        }
        "configmaps" => {
            Ok(Arc::new(AnnotationLock::<ConfigMap>::new(client, "configmaps", namespace, name)))
        }
        "leases" => Ok(Arc::new(LeaseObjectLock::new(client, namespace, name))),
        other => Err(LeaderError::UnknownKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_annotation_json() {
        let record = LeaderRecord {
            holder_identity: "host_abc".into(),
            lease_duration_seconds: 15,
            acquire_time: Some(Utc::now()),
            renew_time: Some(Utc::now()),
            leader_transitions: 3,
        };
        let raw = serde_json::to_string(&record).unwrap();
        assert!(raw.contains("holderIdentity"));
        assert!(raw.contains("leaseDurationSeconds"));
        let back: LeaderRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn in_memory_create_is_exclusive() {
        let lock = InMemoryLock::new();
        let other = lock.clone();
        lock.create(&LeaderRecord::vacant()).await.unwrap();
        assert!(other.create(&LeaderRecord::vacant()).await.is_err());
    }
}
