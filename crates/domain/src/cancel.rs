//! Per-run cancellation token.
//!
//! Each run owns one `CancelToken`. Firing it signals the pipeline driver to
//! stop before its next iterator step, and the agent-runtime client to drop
//! the in-flight request. Firing is one-shot: the first caller wins and
//! later calls are no-ops, so an explicit abort racing a subscriber
//! disconnect cannot double-abort a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A fire-once cancellation token checked by the driver loop and the
/// agent-runtime client.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation. Returns `true` only for the call that actually
    /// fired the token.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
