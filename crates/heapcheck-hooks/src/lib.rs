//! Allocator event interception for heapcheck.
//!
//! This crate is pure mechanism: it owns the four hook slots (allocation,
//! pre-free, mmap, munmap) and the places that fire them. What a hook does
//! with an event is up to whoever installs it.
//!
//! - [`HookedAllocator`] wraps a [`GlobalAlloc`](core::alloc::GlobalAlloc)
//!   and reports every block it hands out or takes back.
//! - [`mmap`] / [`munmap`] wrap the syscalls and report mappings.
//!
//! # Usage
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: heapcheck_hooks::HookedAllocator = heapcheck_hooks::HookedAllocator::system();
//!
//! fn on_new(ptr: *const u8, size: usize) { /* must not deadlock if it allocates */ }
//!
//! heapcheck_hooks::HOOKS.set_new_hook(Some(on_new));
//! ```
//!
//! With no hook installed an allocation pays one relaxed-ordering load and a
//! branch. Without the `hooks` feature the allocator is a plain passthrough.

pub mod hooks;
pub mod mmap;

pub use hooks::{DeleteHook, HOOKS, HookKind, HookTable, MmapHook, MunmapHook, NewHook};
pub use mmap::{mmap, mmap_with, munmap, munmap_with};

use std::alloc::System;

/// A global allocator that reports to a [`HookTable`].
///
/// Allocation hooks fire after the inner allocator succeeded; delete hooks
/// fire before the inner allocator releases the block. A `realloc` is
/// reported as a delete of the old block followed by a new block.
pub struct HookedAllocator<A = System> {
    inner: A,
    hooks: &'static HookTable,
}

impl HookedAllocator<System> {
    /// The system allocator, reporting to [`HOOKS`].
    pub const fn system() -> Self {
        Self {
            inner: System,
            hooks: &HOOKS,
        }
    }
}

impl<A> HookedAllocator<A> {
    /// Wrap `inner`, reporting to [`HOOKS`].
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            hooks: &HOOKS,
        }
    }

    /// Wrap `inner`, reporting to a specific table.
    pub const fn with_table(inner: A, hooks: &'static HookTable) -> Self {
        Self { inner, hooks }
    }

    pub fn hooks(&self) -> &'static HookTable {
        self.hooks
    }
}

impl Default for HookedAllocator<System> {
    fn default() -> Self {
        Self::system()
    }
}

impl<A> core::fmt::Debug for HookedAllocator<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookedAllocator").finish_non_exhaustive()
    }
}

#[cfg(not(feature = "hooks"))]
mod disabled {
    use super::HookedAllocator;
    use core::alloc::{GlobalAlloc, Layout};

    unsafe impl<A: GlobalAlloc> GlobalAlloc for HookedAllocator<A> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { self.inner.alloc(layout) }
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { self.inner.dealloc(ptr, layout) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            unsafe { self.inner.realloc(ptr, layout, new_size) }
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { self.inner.alloc_zeroed(layout) }
        }
    }
}

#[cfg(feature = "hooks")]
mod enabled {
    use super::HookedAllocator;
    use core::alloc::{GlobalAlloc, Layout};

    unsafe impl<A: GlobalAlloc> GlobalAlloc for HookedAllocator<A> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ptr = unsafe { self.inner.alloc(layout) };
            if !ptr.is_null() {
                self.hooks.invoke_new(ptr, layout.size());
            }
            ptr
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.hooks.invoke_delete(ptr, layout.size());
            unsafe { self.inner.dealloc(ptr, layout) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            self.hooks.invoke_delete(ptr, layout.size());
            let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
            if new_ptr.is_null() {
                // The old block is still live.
                self.hooks.invoke_new(ptr, layout.size());
            } else {
                self.hooks.invoke_new(new_ptr, new_size);
            }
            new_ptr
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            let ptr = unsafe { self.inner.alloc_zeroed(layout) };
            if !ptr.is_null() {
                self.hooks.invoke_new(ptr, layout.size());
            }
            ptr
        }
    }
}
