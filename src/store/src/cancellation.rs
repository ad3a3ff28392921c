//! A minimal cooperative cancellation handle.
//!
//! No cancellation-token crate appears anywhere in this codebase's
//! dependency stack, so this is hand-rolled rather than imported: a
//! cheap `Arc<AtomicBool>` flag that every suspension point in the
//! engine and orchestrator can poll between `.await`s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
