//! Single-leader gate over a cluster-side lease object.
//!
//! Competing replicas race to acquire a named lock object; the holder renews
//! it on a fixed cadence and runs the gated workload with a child shutdown
//! channel that fires if the lease is lost. Re-election is not attempted
//! within one process lifetime.

#![forbid(unsafe_code)]

pub mod elector;
pub mod lock;

pub use elector::{LeaderConfig, LeaderElector, LeaderGate};
pub use lock::{new_kube_lock, InMemoryLock, LeaderError, LeaderRecord, LeaseLock};

/// Lease holder identity: `<hostname>_<uuid>`, unique per process.
pub fn default_identity() -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(hostname_from_os)
        .unwrap_or_else(|| "manta".to_string());
    format!("{hostname}_{}", uuid::Uuid::new_v4())
}

#[cfg(target_os = "linux")]
fn hostname_from_os() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(target_os = "linux"))]
fn hostname_from_os() -> Option<String> {
    None
}
