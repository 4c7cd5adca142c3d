use std::sync::Arc;

use tokio::sync::watch;

/// Sending half of a stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<bool>>);

impl ShutdownTx {
    /// Signals every subscriber. Calling it more than once has no further effect.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receiving half of a stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is sent, immediately if it already was.
    pub async fn wait(&mut self) {
        // The sender is owned by the run, if it is gone there is nothing left to stop.
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(Arc::new(tx)), ShutdownRx(rx))
}
