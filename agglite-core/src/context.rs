// agglite-core/src/context.rs
// Shared per-pipeline execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AggLiteError, Result};

/// Execution context shared by every stage of one pipeline.
///
/// Carries the cooperative cancellation flag and the optional deadline
/// derived from `maxTimeMs`. The default `advance` path and every cursor
/// yield point call [`ExecContext::check_interrupt`]; there is no forced
/// preemption.
#[derive(Debug)]
pub struct ExecContext {
    interrupted: AtomicBool,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new() -> Arc<ExecContext> {
        Arc::new(ExecContext {
            interrupted: AtomicBool::new(false),
            deadline: None,
        })
    }

    pub fn with_deadline(max_time: Duration) -> Arc<ExecContext> {
        Arc::new(ExecContext {
            interrupted: AtomicBool::new(false),
            deadline: Some(Instant::now() + max_time),
        })
    }

    /// Signal cooperative cancellation. Stages observe it at their next
    /// `advance` or yield point.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        if self.interrupted.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub fn check_interrupt(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(AggLiteError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        let ctx = ExecContext::new();
        assert!(ctx.check_interrupt().is_ok());
        ctx.interrupt();
        assert_eq!(ctx.check_interrupt(), Err(AggLiteError::Interrupted));
    }

    #[test]
    fn test_deadline() {
        let ctx = ExecContext::with_deadline(Duration::from_millis(0));
        assert!(ctx.is_interrupted());

        let ctx = ExecContext::with_deadline(Duration::from_secs(3600));
        assert!(!ctx.is_interrupted());
    }
}
