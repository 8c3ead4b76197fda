use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation handle shared between the scheduler and every runner.
///
/// Cloning is cheap; all clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct Context {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a live (not cancelled) context
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancel the context. In-flight requests abort at their next I/O boundary.
    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            log::debug!("Context cancelled");
        }
    }

    /// Whether `cancel` has been called on this context or any clone of it
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the context is cancelled, immediately if it already is
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so waiting can only end by cancellation
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
