//! Heap leak checking for Rust processes.
//!
//! Two kinds of check share one engine:
//! - **Local checks**: a [`LeakChecker`] compares the heap at construction
//!   with the heap when one of its verification methods is called.
//! - **Whole-program checks**: a checker started before `main` is verified
//!   at process exit; reachable memory is not a leak.
//!
//! # Usage
//!
//! Install the hooked allocator and the before-main hook once, in the binary:
//! ```rust,ignore
//! heapcheck::heap_checked!();
//! ```
//!
//! Then run with a level:
//! ```bash
//! HEAPCHECK=normal ./my_program
//! ```
//!
//! Local checks work without the environment variable as long as
//! [`install`] was called (or a level was set):
//! ```rust,ignore
//! heapcheck::install();
//! let mut checker = heapcheck::LeakChecker::new("request");
//! handle(request);
//! assert!(checker.no_leaks());
//! ```

pub mod analysis;
pub mod bridge;
pub mod checker;
pub mod cli;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod context;
pub mod dump;
pub mod error;
pub mod exemptions;
pub mod liveness;
pub mod process;
pub mod profile;
pub mod render;
pub mod roots;
pub mod stack;
pub mod stats;
pub mod threads;
pub mod whole_program;

pub use checker::{CheckOutcome, LeakChecker, Policy};
pub use config::Config;
pub use context::{CheckMode, HeapCheck};
pub use error::{Error, Result};
pub use heapcheck_hooks::{HOOKS, HookedAllocator};
pub use whole_program::{
    LiveRoots, Strictness, WholeProgramPolicy, no_global_leaks, start_from_main,
};

/// Make this binary heap-checked: installs [`HookedAllocator`] as the global
/// allocator and runs [`whole_program::before_main`] from `.init_array`.
#[macro_export]
macro_rules! heap_checked {
    () => {
        #[global_allocator]
        static HEAPCHECK_ALLOCATOR: $crate::HookedAllocator = $crate::HookedAllocator::system();

        #[used]
        #[unsafe(link_section = ".init_array")]
        static HEAPCHECK_BEFORE_MAIN: extern "C" fn() = {
            extern "C" fn heapcheck_before_main() {
                $crate::whole_program::before_main();
            }
            heapcheck_before_main
        };
    };
}

/// Start recording into the process-wide profile so local checkers work.
/// Returns false if the allocator hooks already feed another profile.
pub fn install() -> bool {
    HeapCheck::global().install()
}

/// Whether checking is switched on for this process.
pub fn is_active() -> bool {
    HeapCheck::global().is_active()
}

/// Treat the object at `ptr`, and everything reachable from it, as live in
/// whole-program checks.
pub fn ignore_object<T: ?Sized>(ptr: *const T) -> Result<()> {
    HeapCheck::global().ignore_object(ptr)
}

pub fn unignore_object<T: ?Sized>(ptr: *const T) -> Result<()> {
    HeapCheck::global().unignore_object(ptr)
}

/// Leak `value` on purpose: it is never counted by whole-program checks.
pub fn leak<T: 'static>(value: Box<T>) -> &'static mut T {
    let leaked = Box::leak(value);
    let ctx = HeapCheck::global();
    if ctx.profile().is_recording() && std::mem::size_of::<T>() > 0 {
        let _ = ctx.ignore_object(&*leaked as *const T);
    }
    leaked
}

/// Run `cleanup` just before the exit-time check.
pub fn register_cleanup(cleanup: impl FnOnce() + Send + 'static) {
    HeapCheck::global().register_cleanup(cleanup)
}

/// Leave out of full-check diffs every call site whose stack has a symbol
/// matching `pattern`.
pub fn disable_checks_in(pattern: &str) -> Result<()> {
    HeapCheck::global().disable_checks_in(pattern)
}
