//! Cooperative cancellation for long database scans.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation signal polled once per record by long scans (bulk
/// block-index load, the legacy upgrade pass, checkpoint wipes).
///
/// Clones share the underlying flag. An interrupted scan returns
/// [`Error::Interrupted`](crate::Error::Interrupted) without corrupting
/// state; the scan restarts from the beginning on the next run.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals every holder of the flag to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
