//! Process-wide "shutting down" flag shared by the publish and subscribe paths.

use crate::error::{AppError, AppResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    shutting_down: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip to shutting down. Returns `true` only for the call that flipped it.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn ensure_running(&self) -> AppResult<()> {
        if self.is_shutting_down() {
            Err(AppError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}
