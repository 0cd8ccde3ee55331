//! Cancellation token threaded through the transition pipeline.
//!
//! Cancellation observed between election and commit aborts the run without
//! writing; cancellation after commit is ignored (the transition stands).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable cancel flag. All clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}
