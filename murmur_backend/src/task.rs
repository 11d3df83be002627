use std::future::Future;

use tokio::task::AbortHandle;

/// A spawned background task that is aborted when its owner drops it.
///
/// Conversation records own their idle timer and engagement monitor through
/// this type, so removing a record from the store is enough to stop every
/// callback it scheduled.
#[derive(Debug)]
pub struct ScheduledTask {
    abort: Option<AbortHandle>,
}

impl ScheduledTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        Self {
            abort: Some(handle.abort_handle()),
        }
    }

    /// Give up ownership without aborting; the task runs to completion on its own.
    pub fn detach(mut self) {
        self.abort.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}
