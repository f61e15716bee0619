//! The control-plane client seam.
//!
//! Everything upstream of the reflector talks to the cluster through this
//! trait: resolution of `apiVersion`/`kind` pairs into resources, full lists,
//! incremental watches, and the raw transport used by the API reverse proxy.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use manta_core::Object;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("resolve {api_version}/{kind}: {reason}")]
    Resolve { api_version: String, kind: String, reason: String },
    #[error("cluster api: {0}")]
    Api(String),
    #[error("proxy: {0}")]
    Proxy(String),
}

/// A resolved resource kind: what the control plane calls it and whether it
/// is namespace-scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub api_version: String,
    pub kind: String,
    pub plural_name: String,
    pub namespaced: bool,
}

/// Result of a full list: the items plus the resource version to watch from.
#[derive(Debug, Clone)]
pub struct ObjectList {
    pub items: Vec<Object>,
    pub resource_version: String,
}

/// One entry of a watch stream.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Advances the resource version without carrying an object.
    Bookmark(String),
}

pub type EventStream = BoxStream<'static, Result<RawEvent, ClusterError>>;
pub type ByteStream = BoxStream<'static, Result<Bytes, ClusterError>>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// The namespace watches are scoped to; empty means all namespaces.
    fn namespace(&self) -> String;

    /// The namespace of the current context, used for lease objects.
    fn default_namespace(&self) -> String;

    async fn resolve_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResolvedResource, ClusterError>;

    async fn list(
        &self,
        resource: &ResolvedResource,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
        resource_version: Option<&str>,
    ) -> Result<ObjectList, ClusterError>;

    async fn watch(
        &self,
        resource: &ResolvedResource,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
        resource_version: &str,
    ) -> Result<EventStream, ClusterError>;

    /// Raw transport to the API host for the reverse proxy. The request URI
    /// must be path-and-query; the implementation supplies host and auth.
    async fn proxy(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<ByteStream>, ClusterError> {
        let _ = request;
        Err(ClusterError::Proxy("raw transport not supported by this client".into()))
    }
}
