//! Shutdown signalling shared by queue workers.

use tokio::sync::watch;

/// Owner side: flips the flag once.
pub(crate) struct ShutdownTrigger(watch::Sender<bool>);

/// Worker side.
#[derive(Clone)]
pub(crate) struct ShutdownSignal(watch::Receiver<bool>);

pub(crate) fn shutdown_pair() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub(crate) fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered or the owner is gone.
    pub(crate) async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}
