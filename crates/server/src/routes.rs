//! Query endpoints over the cached view.
//!
//! List responses use the envelope `{"total": N, "<field>": [...]}`; the
//! total is always the unpaginated size, and an out-of-range offset or a
//! non-positive limit yields an empty page. Handler errors become
//! `500 {"error": "..."}` and the server stays up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use manta_cluster::ClusterClient;
use manta_engine::CacheView;
use manta_store::Store;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::proxy::{self, AllowList, ProxyState};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address, `:8080` or `host:port`.
    pub addr: String,
    pub health_path: String,
    pub index_path: String,
    pub index_prefix: String,
    pub api_proxy_prefix: String,
    /// Allowlist of IPs/CIDRs; `None` disables the proxy entirely.
    pub api_proxy_allow: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ":8080".to_string(),
            health_path: "/health".to_string(),
            index_path: "/index".to_string(),
            index_prefix: "/index/".to_string(),
            api_proxy_prefix: "/api".to_string(),
            api_proxy_allow: None,
        }
    }
}

#[derive(Clone)]
struct AppState {
    view: Arc<dyn CacheView>,
    proxy: Option<Arc<ProxyState>>,
}

struct ApiError(String);

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl<E: std::error::Error> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": self.0}))).into_response()
    }
}

pub fn router(
    config: &ServerConfig,
    view: Arc<dyn CacheView>,
    cluster: Option<Arc<dyn ClusterClient>>,
) -> Router {
    let proxy = match (&config.api_proxy_allow, cluster) {
        (Some(allow), Some(cluster)) => Some(Arc::new(ProxyState {
            cluster,
            allow: AllowList::parse(allow),
            // An already-/api prefix maps straight onto the API host paths.
            strip_prefix: (!config.api_proxy_prefix.starts_with("/api"))
                .then(|| config.api_proxy_prefix.clone()),
        })),
        _ => None,
    };
    let state = AppState { view, proxy: proxy.clone() };

    let mut router = Router::new()
        .route(&config.health_path, get(health))
        .route(&config.index_path, get(default_index))
        .route(&config.index_prefix, get(index_names))
        .route(&format!("{}:name", config.index_prefix), get(by_index));
    if proxy.is_some() {
        router = router
            .route(&config.api_proxy_prefix, any(api_proxy))
            .route(&format!("{}/*rest", config.api_proxy_prefix.trim_end_matches('/')), any(api_proxy));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serves until shutdown; accepts Go-style `:port` bind addresses.
pub async fn serve(
    config: &ServerConfig,
    router: Router,
    mut shutdown: manta_core::shutdown::ShutdownRx,
) -> anyhow::Result<()> {
    let addr = if config.addr.starts_with(':') {
        format!("0.0.0.0{}", config.addr)
    } else {
        config.addr.clone()
    };
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

type Params = HashMap<String, String>;

fn int_param(params: &Params, name: &str, default: i64) -> i64 {
    params.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn store_for(state: &AppState, params: &Params) -> Result<Store, ApiError> {
    let watch = int_param(params, "watch", 0);
    usize::try_from(watch)
        .ok()
        .and_then(|idx| state.view.store(idx))
        .ok_or_else(|| ApiError::new(format!("watch {watch} not exists")))
}

fn paginated(params: &Params, field: &str, items: Vec<Value>) -> Json<Value> {
    let total = items.len() as i64;
    let offset = int_param(params, "offset", 0);
    let limit = int_param(params, "limit", 200);
    let page: Vec<Value> = if total == 0 || offset < 0 || offset >= total || limit <= 0 {
        Vec::new()
    } else {
        items
            .into_iter()
            .skip(offset as usize)
            .take(limit.min(total) as usize)
            .collect()
    };
    Json(json!({"total": total, field: page}))
}

fn to_values<T: serde::Serialize>(items: Vec<T>) -> Result<Vec<Value>, ApiError> {
    items.into_iter().map(|item| serde_json::to_value(item).map_err(ApiError::from)).collect()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.view.active() {
        (StatusCode::OK, Json(json!({"status": "UP"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "DOWN"})))
    }
}

async fn default_index(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    let store = store_for(&state, &params)?;
    if params.contains_key("keys") {
        return Ok(paginated(&params, "keys", to_values(store.list_keys())?));
    }
    if params.contains_key("list") {
        return Ok(paginated(&params, "items", to_values(store.list())?));
    }
    let key = params.get("key").map(String::as_str).unwrap_or("");
    let items = match store.get(key) {
        Some(obj) => to_values(vec![obj])?,
        None => Vec::new(),
    };
    Ok(paginated(&params, "items", items))
}

async fn index_names(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    let store = store_for(&state, &params)?;
    Ok(paginated(&params, "indexes", to_values(store.index_names())?))
}

async fn by_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    let store = store_for(&state, &params)?;
    if params.contains_key("keys") {
        return Ok(paginated(&params, "keys", to_values(store.index_values(&name)?)?));
    }
    let key = params.get("key").map(String::as_str).unwrap_or("");
    Ok(paginated(&params, "items", to_values(store.by_index(&name, key)?)?))
}

async fn api_proxy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let Some(proxy_state) = &state.proxy else {
        return StatusCode::NOT_FOUND.into_response();
    };
    proxy::forward(proxy_state, addr.ip(), request).await
}
