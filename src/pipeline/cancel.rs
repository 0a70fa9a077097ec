use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared, set-once cancellation flag.
///
/// Every pipeline stage polls the token at each blocking point (one poll
/// interval at most between checks). Once set it is never cleared; cancelling
/// again, or cancelling a pipeline that has already finished, has no effect.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
