//! Cooperative cancellation shared between a job and all of its runs.

use tokio::sync::watch;

/// A cloneable, one-way cancellation flag. Once canceled, it stays canceled.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    sender: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create a new, un-canceled signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: std::sync::Arc::new(sender),
        }
    }

    /// Request cancellation. Wakes everybody waiting in [`Self::canceled`].
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Has cancellation been requested?
    pub fn is_canceled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn canceled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = receiver.wait_for(|canceled| *canceled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
