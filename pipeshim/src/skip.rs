//! Cooperative skip signal shared by the host and running operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag asking the in-flight operation to give up at its next safe point.
///
/// The bridge never interrupts an operation. Operations poll this flag (or use
/// [`crate::wait::wait_until_or_skipped`]) and consume it with [`take`](Self::take)
/// so one request skips one operation.
#[derive(Debug, Clone, Default)]
pub struct SkipSignal {
    flag: Arc<AtomicBool>,
}

impl SkipSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::info!("Skip requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consume a pending skip. Returns whether one was pending.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
