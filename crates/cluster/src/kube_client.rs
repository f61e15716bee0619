//! Kube-backed `ClusterClient`: discovery-cached resource resolution,
//! dynamic-object list/watch, and the raw proxy transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use kube::api::{Api, ListParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, WatchEvent};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use manta_core::Object;
use serde_json::Value;
use tracing::debug;

use crate::client::{
    ByteStream, ClusterClient, ClusterError, EventStream, ObjectList, RawEvent, ResolvedResource,
};

#[derive(Debug, Clone, Default)]
pub struct KubeClusterOptions {
    pub kubeconfig: Option<PathBuf>,
    pub server: Option<String>,
    pub namespace: Option<String>,
    pub all_namespaces: bool,
}

pub struct KubeClusterClient {
    client: Client,
    default_namespace: String,
    namespace: Option<String>,
    all_namespaces: bool,
    // apiVersion/kind -> resolved resource, filled from discovery.
    resolve_cache: RwLock<HashMap<String, ResolvedResource>>,
}

impl KubeClusterClient {
    pub async fn new(opts: &KubeClusterOptions) -> Result<Self, ClusterError> {
        let mut config = match &opts.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Api(format!("read kubeconfig: {e}")))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Api(format!("load kubeconfig: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Api(format!("infer cluster config: {e}")))?,
        };
        if let Some(server) = &opts.server {
            config.cluster_url = server
                .parse()
                .map_err(|e| ClusterError::Api(format!("bad --server url: {e}")))?;
        }
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Api(format!("build cluster client: {e}")))?;
        Ok(Self {
            client,
            default_namespace,
            namespace: opts.namespace.clone(),
            all_namespaces: opts.all_namespaces,
            resolve_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn raw_client(&self) -> Client {
        self.client.clone()
    }

    fn api_for(&self, resource: &ResolvedResource, namespace: &str) -> Api<DynamicObject> {
        let (group, version) = split_api_version(&resource.api_version);
        let ar = ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            plural: resource.plural_name.clone(),
        };
        if resource.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// List items come back without their type metadata; stamp it so accessors
/// and handler payloads always see apiVersion/kind.
fn object_from_dynamic(
    resource: &ResolvedResource,
    obj: &DynamicObject,
) -> Result<Object, ClusterError> {
    let mut raw = serde_json::to_value(obj)
        .map_err(|e| ClusterError::Api(format!("serialize object: {e}")))?;
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        map.entry("kind").or_insert_with(|| Value::String(resource.kind.clone()));
    }
    Ok(Object::new(raw))
}

fn selectors<'a>(label_selector: &'a str, field_selector: &'a str) -> (Option<&'a str>, Option<&'a str>) {
    let labels = (!label_selector.is_empty()).then_some(label_selector);
    let fields = (!field_selector.is_empty()).then_some(field_selector);
    (labels, fields)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn namespace(&self) -> String {
        if self.all_namespaces {
            return String::new();
        }
        match &self.namespace {
            Some(ns) if !ns.is_empty() => ns.clone(),
            _ => self.default_namespace(),
        }
    }

    fn default_namespace(&self) -> String {
        if self.default_namespace.is_empty() {
            "default".to_string()
        } else {
            self.default_namespace.clone()
        }
    }

    async fn resolve_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResolvedResource, ClusterError> {
        let cache_key = format!("{api_version}/{kind}");
        if let Some(found) = self.resolve_cache.read().unwrap().get(&cache_key) {
            return Ok(found.clone());
        }
        let (group, version) = split_api_version(api_version);
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(|e| {
            ClusterError::Resolve {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                reason: format!("discovery: {e}"),
            }
        })?;
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                if ar.group == group && ar.version == version && ar.kind == kind {
                    let resolved = ResolvedResource {
                        api_version: api_version.to_string(),
                        kind: kind.to_string(),
                        plural_name: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    };
                    debug!(resource = %cache_key, plural = %resolved.plural_name, "resolved resource");
                    self.resolve_cache.write().unwrap().insert(cache_key, resolved.clone());
                    return Ok(resolved);
                }
            }
        }
        Err(ClusterError::Resolve {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            reason: "not served by the cluster".to_string(),
        })
    }

    async fn list(
        &self,
        resource: &ResolvedResource,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
        resource_version: Option<&str>,
    ) -> Result<ObjectList, ClusterError> {
        let api = self.api_for(resource, namespace);
        let (labels, fields) = selectors(label_selector, field_selector);
        let mut lp = ListParams::default();
        if let Some(sel) = labels {
            lp = lp.labels(sel);
        }
        if let Some(sel) = fields {
            lp = lp.fields(sel);
        }
        // A consistent read from current state is what the reflector wants;
        // the advisory resource version is only relevant to mock transports.
        let _ = resource_version;
        let list = api.list(&lp).await.map_err(|e| ClusterError::Api(e.to_string()))?;
        let rv = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .iter()
            .map(|o| object_from_dynamic(resource, o))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList { items, resource_version: rv })
    }

    async fn watch(
        &self,
        resource: &ResolvedResource,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
        resource_version: &str,
    ) -> Result<EventStream, ClusterError> {
        let api = self.api_for(resource, namespace);
        let (labels, fields) = selectors(label_selector, field_selector);
        let mut wp = WatchParams::default();
        if let Some(sel) = labels {
            wp = wp.labels(sel);
        }
        if let Some(sel) = fields {
            wp = wp.fields(sel);
        }
        let stream = api
            .watch(&wp, resource_version)
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let resource = resource.clone();
        Ok(stream
            .map(move |item| match item {
                Ok(WatchEvent::Added(o)) => Ok(RawEvent::Added(object_from_dynamic(&resource, &o)?)),
                Ok(WatchEvent::Modified(o)) => {
                    Ok(RawEvent::Modified(object_from_dynamic(&resource, &o)?))
                }
                Ok(WatchEvent::Deleted(o)) => {
                    Ok(RawEvent::Deleted(object_from_dynamic(&resource, &o)?))
                }
                Ok(WatchEvent::Bookmark(b)) => Ok(RawEvent::Bookmark(b.metadata.resource_version)),
                Ok(WatchEvent::Error(e)) => Err(ClusterError::Api(e.message)),
                Err(e) => Err(ClusterError::Api(e.to_string())),
            })
            .boxed())
    }

    async fn proxy(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<ByteStream>, ClusterError> {
        let (mut parts, body) = request.into_parts();
        // The client supplies host and credentials; drop what the caller sent.
        parts.headers.remove(http::header::HOST);
        parts.headers.remove(http::header::AUTHORIZATION);
        let mut outbound = http::Request::builder()
            .method(parts.method)
            .uri(parts.uri)
            .body(kube::client::Body::from(body.to_vec()))
            .map_err(|e| ClusterError::Proxy(e.to_string()))?;
        *outbound.headers_mut() = parts.headers;
        let response = self
            .client
            .send(outbound)
            .await
            .map_err(|e| ClusterError::Proxy(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let stream = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(|e| ClusterError::Proxy(e.to_string())))
            .boxed();
        Ok(http::Response::from_parts(parts, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_splits_into_group_and_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    }

    #[test]
    fn dynamic_objects_are_stamped_with_type_meta() {
        let resource = ResolvedResource {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            plural_name: "configmaps".into(),
            namespaced: true,
        };
        let obj: DynamicObject =
            serde_json::from_value(serde_json::json!({"metadata": {"name": "a", "namespace": "ns1"}}))
                .unwrap();
        let stamped = object_from_dynamic(&resource, &obj).unwrap();
        assert_eq!(stamped.api_version(), "v1");
        assert_eq!(stamped.kind(), "ConfigMap");
        assert_eq!(stamped.key(), "ns1/a");
    }
}
