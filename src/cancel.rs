//! Cooperative cancellation shared between a build and its workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap clonable flag checked between units of work.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Flag,
}

#[derive(Debug, Clone)]
enum Flag {
    Owned(Arc<AtomicBool>),
    Static(&'static AtomicBool),
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Flag::Owned(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Observe a process-wide flag, e.g. one set from a signal handler.
    pub fn from_static(flag: &'static AtomicBool) -> Self {
        Self {
            flag: Flag::Static(flag),
        }
    }

    pub fn cancel(&self) {
        self.atomic().store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.atomic().load(Ordering::SeqCst)
    }

    fn atomic(&self) -> &AtomicBool {
        match &self.flag {
            Flag::Owned(flag) => flag,
            Flag::Static(flag) => flag,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
