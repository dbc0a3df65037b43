//! Work to run just before the final whole-program check.
//!
//! Long-lived caches and pools are usually torn down by destructors that run
//! after the process-exit check. Registering their teardown here frees them
//! in time to be counted as released.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct CleanupRegistry {
    pending: Mutex<Vec<Cleanup>>,
    ran: AtomicBool,
}

impl CleanupRegistry {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
        }
    }

    /// Add a cleanup. Cleanups registered after [`CleanupRegistry::run`]
    /// are dropped without running.
    pub fn register(&self, cleanup: impl FnOnce() + Send + 'static) {
        if self.ran.load(Ordering::Acquire) {
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(cleanup));
    }

    /// Run every registered cleanup once, in registration order. Later calls
    /// do nothing. Returns how many ran.
    pub fn run(&self) -> usize {
        if self.ran.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let count = pending.len();
        for cleanup in pending {
            cleanup();
        }
        count
    }

    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.len())
            .field("ran", &self.has_run())
            .finish()
    }
}
