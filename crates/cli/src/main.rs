//! manta: watch cluster resources and hand every transition to a child
//! process and/or webhooks, with a queryable in-memory view.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use manta_cluster::{ClusterClient, KubeClusterClient};
use manta_core::shutdown::{ShutdownRx, ShutdownTx};
use manta_engine::{Engine, HandlerPipeline};
use manta_leader::{default_identity, new_kube_lock, LeaderConfig, LeaderElector, LeaderGate};
use tracing::{debug, error, info};

mod appctx;
mod options;

use options::{Config, Options};

fn init_tracing() {
    let env = std::env::var("MANTA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MANTA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MANTA_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    init_metrics();
    let opts = Options::parse();
    let config = Config::from_options(&opts)?;

    let app = appctx::start();
    if std::process::id() == 1 {
        manta_engine::reaper::start(app.subscribe());
    }

    let client =
        Arc::new(KubeClusterClient::new(&config.cluster).await.context("cluster client")?);

    let gate = match &config.leader {
        None => LeaderGate::disabled(),
        Some(leader) => {
            let namespace =
                leader.namespace.clone().unwrap_or_else(|| client.default_namespace());
            let lock = new_kube_lock(client.raw_client(), &leader.kind, &namespace, &leader.name)
                .context("leader election lock")?;
            LeaderGate::new(LeaderElector::new(
                lock,
                LeaderConfig {
                    identity: default_identity(),
                    lease_duration: leader.lease_duration,
                    renew_deadline: leader.renew_deadline,
                    retry_period: leader.retry_period,
                },
            ))
        }
    };

    let parent = app.tx();
    gate.run(app.subscribe(), parent.clone(), |ctx| {
        run_engine(config, client.clone(), parent.clone(), ctx)
    })
    .await;

    app.end().await;
    Ok(())
}

async fn run_engine(
    config: Config,
    client: Arc<KubeClusterClient>,
    parent: ShutdownTx,
    shutdown: ShutdownRx,
) {
    let cluster: Arc<dyn ClusterClient> = client;
    let handler = Arc::new(HandlerPipeline::new(config.pipeline));
    let mut engine = Engine::new(cluster.clone(), handler, config.indexers, config.engine);

    let namespace = cluster.namespace();
    for watch in &config.watches {
        let mut spec = watch.clone();
        spec.namespace = namespace.clone();
        match engine.add_watch(spec).await {
            Ok(index) => {
                debug!(index, api_version = %watch.api_version, kind = %watch.kind, "watch registered")
            }
            Err(e) => {
                error!(api_version = %watch.api_version, kind = %watch.kind, error = %e, "failed to add watch; skipping")
            }
        }
    }
    if engine.watch_count() == 0 {
        error!("no watches established; shutting down");
        parent.shutdown();
        return;
    }
    let engine = Arc::new(engine);

    let mut server_task = None;
    if let Some(server_config) = &config.server {
        let router =
            manta_server::router(server_config, engine.clone(), Some(cluster.clone()));
        let server_config = server_config.clone();
        let server_shutdown = shutdown.clone();
        let parent = parent.clone();
        server_task = Some(tokio::spawn(async move {
            if let Err(e) = manta_server::serve(&server_config, router, server_shutdown).await {
                error!(error = %e, "http server exited");
                parent.shutdown();
            }
        }));
    }

    if let Err(e) = engine.run(shutdown).await {
        error!(error = %e, "engine exited");
        parent.shutdown();
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }
}
