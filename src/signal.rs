use std::sync::Arc;

use tokio::sync::watch;

/// A set-once flag that any number of tasks can wait for. Firing is idempotent, and waiters
///  arriving after the signal fired return immediately.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}

impl Signal {
    pub fn new() -> Signal {
        let (tx, _) = watch::channel(false);
        Signal { tx: Arc::new(tx) }
    }

    /// Returns `true` for the call that actually fired the signal
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            }
            else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot be closed while we wait
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
