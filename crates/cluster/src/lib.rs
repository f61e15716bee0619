//! Manta cluster edge: the `ClusterClient` seam over the control-plane API,
//! its kube-backed implementation with a discovery cache, an in-memory mock
//! for tests, and the per-watch reflector loop.

#![forbid(unsafe_code)]

pub mod client;
pub mod kube_client;
pub mod mock;
pub mod reflector;

pub use client::{
    ByteStream, ClusterClient, ClusterError, EventStream, ObjectList, RawEvent, ResolvedResource,
};
pub use kube_client::{KubeClusterClient, KubeClusterOptions};
pub use mock::MockClusterClient;
pub use reflector::{EventSink, Reflector};
