use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_types::error::{KeelError, Result};
use tracing::info;

/// Cooperative cancellation flag shared between a run and its controller.
///
/// Long-running work polls [`CancellationToken::rendezvous`] before each
/// phase-transition commit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checkpoint before `phase`. Errors with `Cancelled` once cancelled.
    pub fn rendezvous(&self, phase: &str) -> Result<()> {
        if self.is_cancelled() {
            info!(phase, "cancellation observed");
            return Err(KeelError::Cancelled(phase.to_string()));
        }
        Ok(())
    }
}
