//! Orphan-process reaper for PID-1 operation.
//!
//! When the process runs as init, orphaned children reparent onto it and must
//! be waited on. The reaper loops on SIGCHLD; it is paused (strictly
//! reference-counted: paused iff count > 0) around the dispatch of our own
//! handler child so its `waitpid(-1)` cannot race the handler's wait.
//!
//! The pause counter is deliberately process-global: there is one reaper per
//! process. Outside Linux every entry point is a no-op.

use std::sync::atomic::{AtomicI32, Ordering};

use manta_core::shutdown::ShutdownRx;

static PAUSE_COUNT: AtomicI32 = AtomicI32::new(0);

/// Pauses the reaper until the guard drops.
pub fn pause() -> PauseGuard {
    PAUSE_COUNT.fetch_add(1, Ordering::SeqCst);
    PauseGuard(())
}

pub fn is_paused() -> bool {
    PAUSE_COUNT.load(Ordering::SeqCst) > 0
}

pub struct PauseGuard(());

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let previous = PAUSE_COUNT.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            // Last pause released: collect anything that exited meanwhile.
            imp::wake();
        }
    }
}

pub fn start(shutdown: ShutdownRx) {
    imp::start(shutdown);
}

#[cfg(target_os = "linux")]
mod imp {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use once_cell::sync::Lazy;
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::Notify;
    use tracing::{info, warn};

    use super::is_paused;
    use manta_core::shutdown::ShutdownRx;

    static WAKE: Lazy<Notify> = Lazy::new(Notify::new);

    pub(super) fn wake() {
        WAKE.notify_one();
    }

    pub(super) fn start(mut shutdown: ShutdownRx) {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGCHLD handler; reaper disabled");
                return;
            }
        };
        tokio::spawn(async move {
            info!("orphan reaper running");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sigchld.recv() => {
                        if !is_paused() {
                            reap();
                        }
                    }
                    _ = WAKE.notified() => {
                        if !is_paused() {
                            reap();
                        }
                    }
                }
            }
        });
    }

    fn reap() {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    info!(pid = %pid, code, "reaped orphan");
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    info!(pid = %pid, signal = ?sig, "reaped signaled orphan");
                }
                Ok(WaitStatus::StillAlive) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use manta_core::shutdown::ShutdownRx;

    pub(super) fn wake() {}

    pub(super) fn start(_shutdown: ShutdownRx) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_is_reference_counted() {
        assert!(!is_paused());
        let a = pause();
        let b = pause();
        assert!(is_paused());
        drop(a);
        assert!(is_paused());
        drop(b);
        assert!(!is_paused());
    }
}
