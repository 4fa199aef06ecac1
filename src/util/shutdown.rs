use tokio::sync::watch;
use tracing::debug;

/// Cooperative stop signal for a node's worker tasks. Every worker holds a [Shutdown] and checks
///  it at each of its suspension points; the owning node keeps the [ShutdownTrigger].
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}
impl ShutdownTrigger {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownTrigger { sender }, Shutdown { receiver })
    }

    pub fn trigger(&self) {
        debug!("triggering shutdown");
        self.sender.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { receiver: self.sender.subscribe() }
    }
}

#[derive(Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}
impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once shutdown was triggered, or the trigger was dropped. This is cancellation
    ///  safe, so it can be used as a `select!` branch.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|&triggered| triggered).await;
    }
}
