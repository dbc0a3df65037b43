//! Single-slot hook tables for allocator events.
//!
//! Each event kind has exactly one slot. Installing a hook swaps it in and
//! hands back whatever was installed before, so callers that want several
//! observers chain them themselves. Invoking an empty slot costs one atomic
//! load and a branch.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Called after an allocation succeeded, with the new block and its size.
pub type NewHook = fn(ptr: *const u8, size: usize);

/// Called before a block is released, while it is still safe to inspect.
pub type DeleteHook = fn(ptr: *const u8, size: usize);

/// Called after `mmap` returned, with its result and the original arguments.
pub type MmapHook = fn(
    result: *const u8,
    start: *const u8,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
);

/// Called before `munmap` runs, with the same arguments.
pub type MunmapHook = fn(start: *const u8, len: usize);

/// The event kinds a [`HookTable`] dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    New,
    Delete,
    Mmap,
    Munmap,
}

/// One callback slot per event kind.
///
/// Slots hold function pointers as plain addresses (0 = empty). The table
/// never takes a lock: a hook body that needs one is responsible for its own
/// re-entrancy, because anything it allocates comes straight back here.
#[derive(Debug)]
pub struct HookTable {
    new: AtomicUsize,
    delete: AtomicUsize,
    mmap: AtomicUsize,
    munmap: AtomicUsize,
}

/// The process-wide table used by [`crate::HookedAllocator::system`] and the
/// [`crate::mmap`] wrappers.
pub static HOOKS: HookTable = HookTable::new();

impl HookTable {
    pub const fn new() -> Self {
        Self {
            new: AtomicUsize::new(0),
            delete: AtomicUsize::new(0),
            mmap: AtomicUsize::new(0),
            munmap: AtomicUsize::new(0),
        }
    }

    /// Install (or with `None`, remove) the allocation hook. Returns the previous one.
    pub fn set_new_hook(&self, hook: Option<NewHook>) -> Option<NewHook> {
        let prev = self.new.swap(hook.map_or(0, |h| h as usize), Ordering::AcqRel);
        // SAFETY: the slot only ever holds 0 or an address taken from a `NewHook`.
        unsafe { raw_new(prev) }
    }

    /// Install (or remove) the pre-free hook. Returns the previous one.
    pub fn set_delete_hook(&self, hook: Option<DeleteHook>) -> Option<DeleteHook> {
        let prev = self
            .delete
            .swap(hook.map_or(0, |h| h as usize), Ordering::AcqRel);
        // SAFETY: the slot only ever holds 0 or an address taken from a `DeleteHook`.
        unsafe { raw_new(prev) }
    }

    /// Install (or remove) the mapping hook. Returns the previous one.
    pub fn set_mmap_hook(&self, hook: Option<MmapHook>) -> Option<MmapHook> {
        let prev = self
            .mmap
            .swap(hook.map_or(0, |h| h as usize), Ordering::AcqRel);
        // SAFETY: the slot only ever holds 0 or an address taken from a `MmapHook`.
        unsafe { raw_mmap(prev) }
    }

    /// Install (or remove) the unmapping hook. Returns the previous one.
    pub fn set_munmap_hook(&self, hook: Option<MunmapHook>) -> Option<MunmapHook> {
        let prev = self
            .munmap
            .swap(hook.map_or(0, |h| h as usize), Ordering::AcqRel);
        // SAFETY: the slot only ever holds 0 or an address taken from a `MunmapHook`.
        unsafe { raw_munmap(prev) }
    }

    /// Whether a hook is installed for `kind`.
    pub fn is_installed(&self, kind: HookKind) -> bool {
        let slot = match kind {
            HookKind::New => &self.new,
            HookKind::Delete => &self.delete,
            HookKind::Mmap => &self.mmap,
            HookKind::Munmap => &self.munmap,
        };
        slot.load(Ordering::Acquire) != 0
    }

    /// Remove every hook.
    pub fn clear(&self) {
        self.new.store(0, Ordering::Release);
        self.delete.store(0, Ordering::Release);
        self.mmap.store(0, Ordering::Release);
        self.munmap.store(0, Ordering::Release);
    }

    #[inline]
    pub fn invoke_new(&self, ptr: *const u8, size: usize) {
        let raw = self.new.load(Ordering::Acquire);
        // SAFETY: see `set_new_hook`.
        if let Some(hook) = unsafe { raw_new(raw) } {
            hook(ptr, size);
        }
    }

    #[inline]
    pub fn invoke_delete(&self, ptr: *const u8, size: usize) {
        let raw = self.delete.load(Ordering::Acquire);
        // SAFETY: see `set_delete_hook`.
        if let Some(hook) = unsafe { raw_new(raw) } {
            hook(ptr, size);
        }
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn invoke_mmap(
        &self,
        result: *const u8,
        start: *const u8,
        len: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) {
        let raw = self.mmap.load(Ordering::Acquire);
        // SAFETY: see `set_mmap_hook`.
        if let Some(hook) = unsafe { raw_mmap(raw) } {
            hook(result, start, len, prot, flags, fd, offset);
        }
    }

    #[inline]
    pub fn invoke_munmap(&self, start: *const u8, len: usize) {
        let raw = self.munmap.load(Ordering::Acquire);
        // SAFETY: see `set_munmap_hook`.
        if let Some(hook) = unsafe { raw_munmap(raw) } {
            hook(start, len);
        }
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

// `NewHook` and `DeleteHook` share a signature, so one conversion serves both.
#[inline]
unsafe fn raw_new(raw: usize) -> Option<NewHook> {
    if raw == 0 {
        None
    } else {
        Some(unsafe { core::mem::transmute::<usize, NewHook>(raw) })
    }
}

#[inline]
unsafe fn raw_mmap(raw: usize) -> Option<MmapHook> {
    if raw == 0 {
        None
    } else {
        Some(unsafe { core::mem::transmute::<usize, MmapHook>(raw) })
    }
}

#[inline]
unsafe fn raw_munmap(raw: usize) -> Option<MunmapHook> {
    if raw == 0 {
        None
    } else {
        Some(unsafe { core::mem::transmute::<usize, MunmapHook>(raw) })
    }
}
