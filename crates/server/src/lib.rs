//! Manta HTTP surface: health, list/get/by-index queries over the cached
//! view, and an optional reverse proxy to the cluster API.

#![forbid(unsafe_code)]

pub mod proxy;
pub mod routes;

pub use proxy::AllowList;
pub use routes::{router, serve, ServerConfig};
