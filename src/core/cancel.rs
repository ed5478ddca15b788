//! Cooperative cancellation
//!
//! A shared flag polled by the engine loops between units of work. Raising
//! it stops new rules and pipeline steps from being scheduled; whatever
//! action call is already in flight runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable cancel handle shared between an operator and the engine
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for the next run
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
