//! Acquire/renew loop and the gate that runs the engine only while leading.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manta_core::shutdown::{self, ShutdownRx, ShutdownTx};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lock::{LeaderRecord, LeaseLock};

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            identity: crate::default_identity(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: LeaderConfig,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: LeaderConfig) -> Self {
        Self { lock, config }
    }

    /// Blocks until the lease is acquired, then runs `leading` with a child
    /// shutdown channel that fires when the lease is lost. Returns once
    /// `leading` returns; the lease is not re-contested in-process.
    pub async fn run<F, Fut>(&self, mut shutdown: ShutdownRx, leading: F)
    where
        F: FnOnce(ShutdownRx) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            if try_acquire_or_renew(self.lock.as_ref(), &self.config).await {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
        info!(identity = %self.config.identity, lock = %self.lock.describe(), "leadership acquired");

        let (lost_tx, lost_rx) = shutdown::channel();
        let renewer = tokio::spawn(renew_loop(
            self.lock.clone(),
            self.config.clone(),
            shutdown,
            lost_tx.clone(),
        ));
        leading(lost_rx).await;
        lost_tx.shutdown();
        renewer.abort();
        let _ = renewer.await;
    }
}

async fn renew_loop(
    lock: Arc<dyn LeaseLock>,
    config: LeaderConfig,
    mut parent: ShutdownRx,
    lost: ShutdownTx,
) {
    let mut last_renew = Instant::now();
    loop {
        tokio::select! {
            _ = parent.changed() => {
                lost.shutdown();
                return;
            }
            _ = tokio::time::sleep(config.retry_period) => {}
        }
        if try_acquire_or_renew(lock.as_ref(), &config).await {
            last_renew = Instant::now();
        } else if last_renew.elapsed() >= config.renew_deadline {
            warn!(identity = %config.identity, "leadership lost");
            lost.shutdown();
            return;
        }
    }
}

async fn try_acquire_or_renew(lock: &dyn LeaseLock, config: &LeaderConfig) -> bool {
    let now = Utc::now();
    let current = match lock.get().await {
        Ok(current) => current,
        Err(e) => {
            warn!(error = %e, "lease read failed");
            return false;
        }
    };
    match current {
        None => {
            let record = LeaderRecord {
                holder_identity: config.identity.clone(),
                lease_duration_seconds: config.lease_duration.as_secs() as i64,
                acquire_time: Some(now),
                renew_time: Some(now),
                leader_transitions: 0,
            };
            match lock.create(&record).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "lease create lost the race");
                    false
                }
            }
        }
        Some(mut record) => {
            if record.holder_identity != config.identity {
                if !expired(&record, now) {
                    return false;
                }
                info!(previous = %record.holder_identity, "taking over expired lease");
                record.leader_transitions += 1;
                record.acquire_time = Some(now);
            }
            record.holder_identity = config.identity.clone();
            record.lease_duration_seconds = config.lease_duration.as_secs() as i64;
            if record.acquire_time.is_none() {
                record.acquire_time = Some(now);
            }
            record.renew_time = Some(now);
            match lock.update(&record).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "lease renew failed");
                    false
                }
            }
        }
    }
}

fn expired(record: &LeaderRecord, now: chrono::DateTime<Utc>) -> bool {
    if record.holder_identity.is_empty() {
        return true;
    }
    let Some(renewed) = record.renew_time.or(record.acquire_time) else {
        return true;
    };
    renewed + chrono::Duration::seconds(record.lease_duration_seconds) <= now
}

/// Runs the workload directly when election is disabled; otherwise through
/// the elector, cancelling the parent context when the gated workload
/// returns so the process unwinds.
pub struct LeaderGate {
    elector: Option<LeaderElector>,
}

impl LeaderGate {
    pub fn disabled() -> Self {
        Self { elector: None }
    }

    pub fn new(elector: LeaderElector) -> Self {
        Self { elector: Some(elector) }
    }

    pub async fn run<F, Fut>(&self, shutdown: ShutdownRx, parent: ShutdownTx, leading: F)
    where
        F: FnOnce(ShutdownRx) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        match &self.elector {
            None => leading(shutdown).await,
            Some(elector) => {
                elector.run(shutdown, leading).await;
                parent.shutdown();
            }
        }
    }
}
