//! Cooperative cancellation context.
//!
//! A `Cx` is handed to every long-running loop. Cancellation is a request, not
//! an interrupt: loops observe it between iterations via [`Cx::checkpoint`] and
//! finish any in-flight flush before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flowlog_error::{FlowlogError, Result};

#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes the request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() {
            return Err(FlowlogError::Cancelled);
        }
        Ok(())
    }
}
