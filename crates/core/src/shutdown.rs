//! Shutdown coordination channel shared by the long-lived loops.
//!
//! One transmitter at the root, one receiver per loop. Receivers must be
//! subscribed before shutdown is triggered; a late subscription misses the
//! signal.

use tokio::sync::watch;

/// Transmitter side; cloneable so intermediate owners can trigger shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Signals every subscribed receiver. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiver side: `rx.changed().await` resolves once shutdown is requested.
pub type ShutdownRx = watch::Receiver<()>;

pub fn channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}
