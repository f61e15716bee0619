//! Root cancellation context: SIGINT/SIGTERM handling and orderly end.

use manta_core::shutdown::{self, ShutdownRx, ShutdownTx};
use tracing::{info, warn};

pub struct App {
    tx: ShutdownTx,
    signal_task: tokio::task::JoinHandle<()>,
}

pub fn start() -> App {
    let (tx, rx) = shutdown::channel();
    let signal_task = tokio::spawn(handle_signals(tx.clone(), rx));
    App { tx, signal_task }
}

impl App {
    pub fn subscribe(&self) -> ShutdownRx {
        self.tx.subscribe()
    }

    pub fn tx(&self) -> ShutdownTx {
        self.tx.clone()
    }

    /// Cancels the root context and waits for the signal watcher.
    pub async fn end(self) {
        self.tx.shutdown();
        let _ = self.signal_task.await;
    }
}

#[cfg(unix)]
async fn handle_signals(tx: ShutdownTx, mut rx: ShutdownRx) {
    use tokio::signal::unix::{signal, SignalKind};
    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());
    let (mut interrupt, mut terminate) = match (interrupt, terminate) {
        (Ok(i), Ok(t)) => (i, t),
        (i, t) => {
            warn!(
                interrupt_err = i.is_err(),
                terminate_err = t.is_err(),
                "failed to install signal handlers"
            );
            let _ = rx.changed().await;
            return;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => info!("signal interrupt"),
        _ = terminate.recv() => info!("signal terminate"),
        _ = rx.changed() => return,
    }
    tx.shutdown();
}

#[cfg(not(unix))]
async fn handle_signals(tx: ShutdownTx, mut rx: ShutdownRx) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("signal interrupt"),
        _ = rx.changed() => return,
    }
    tx.shutdown();
}
