use tokio::sync::watch;

/// Sending half of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal every [`Shutdown`] cloned from this trigger's channel.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
        tracing::info!("shutdown requested");
    }

    /// A new receiver on this trigger's channel.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving half of a shutdown signal.
///
/// Cheap to clone. Every wait in the crate races against [`Shutdown::wait`]
/// so that pending sleeps and polls end promptly once shutdown is requested.
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a linked trigger and receiver.
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownTrigger { sender }, Shutdown { receiver })
    }

    /// A receiver that is never signalled.
    pub fn never() -> Self {
        let (_, shutdown) = Self::channel();
        shutdown
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is requested. Never resolves if the trigger was
    /// dropped without firing.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();

        loop {
            if *receiver.borrow_and_update() {
                return;
            }

            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
