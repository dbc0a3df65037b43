//! Glue between the allocator hooks and a heap profile.
//!
//! The hooks run on every allocation in the process, so they stay small:
//! bail out if this thread is already inside the checker, capture the stack,
//! and update the table. Nothing in here logs.

use crate::profile::{HeapProfile, RecordingGuard};
use crate::stack::{self, StackTrace};
use heapcheck_hooks::HOOKS;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

/// Paths of the functions between an allocating call and the hook: the
/// hooked allocator, the global allocator shims and the `alloc` entry points.
const ALLOCATOR_PATHS: &[&str] = &[
    "heapcheck_hooks::",
    "__rust_",
    "__rustc::",
    "__rdl_",
    "__rg_",
    "alloc::alloc::",
    "alloc::raw_vec::",
    "alloc::boxed::",
    "core::alloc::",
    "std::alloc::",
];

/// Verdicts per function start address, so each function is symbolized once.
static ALLOCATOR_FRAMES: LazyLock<Mutex<HashMap<usize, bool>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static TARGET: OnceLock<Arc<HeapProfile>> = OnceLock::new();

fn target() -> Option<&'static HeapProfile> {
    TARGET.get().map(Arc::as_ref)
}

#[inline(never)]
fn on_new(ptr: *const u8, size: usize) {
    let Some(_guard) = RecordingGuard::try_enter() else {
        return;
    };
    let Some(profile) = target() else {
        return;
    };
    if !profile.is_recording() {
        return;
    }
    let stack = StackTrace::capture_after_skipping(
        on_new as fn(*const u8, usize) as usize,
        profile.max_stack_depth(),
        is_allocator_frame,
    );
    profile.record_alloc(ptr as usize, size, &stack);
}

/// Whether a demangled function name belongs to allocation plumbing rather
/// than to the code that asked for memory.
fn is_allocator_symbol(name: &str) -> bool {
    let path = name.trim_start_matches('<');
    ALLOCATOR_PATHS.iter().any(|prefix| path.starts_with(prefix))
}

fn is_allocator_frame(symbol: usize, ip: usize) -> bool {
    let key = if symbol != 0 { symbol } else { ip };
    let mut frames = ALLOCATOR_FRAMES.lock().unwrap_or_else(|p| p.into_inner());
    *frames.entry(key).or_insert_with(|| {
        // Return addresses point past the call; step back into it.
        stack::enclosing_function_name(ip.saturating_sub(1))
            .is_some_and(|name| is_allocator_symbol(&name))
    })
}

fn on_delete(ptr: *const u8, _size: usize) {
    let Some(_guard) = RecordingGuard::try_enter() else {
        return;
    };
    if let Some(profile) = target() {
        profile.record_free(ptr as usize);
    }
}

fn on_mmap(
    result: *const u8,
    _start: *const u8,
    len: usize,
    _prot: i32,
    _flags: i32,
    _fd: i32,
    _offset: i64,
) {
    if result as usize == libc::MAP_FAILED as usize {
        return;
    }
    let Some(_guard) = RecordingGuard::try_enter() else {
        return;
    };
    if let Some(profile) = target() {
        profile.record_mmap(len);
    }
}

fn on_munmap(_start: *const u8, len: usize) {
    let Some(_guard) = RecordingGuard::try_enter() else {
        return;
    };
    if let Some(profile) = target() {
        profile.record_munmap(len);
    }
}

/// Route the process-wide hooks into `profile` and start recording.
///
/// Only the first profile ever installed receives events; installing a
/// different one later returns false and changes nothing. Hooks that were
/// already in the slots are replaced.
pub fn install(profile: &Arc<HeapProfile>) -> bool {
    let _guard = RecordingGuard::enter();
    let installed = TARGET.get_or_init(|| Arc::clone(profile));
    if !Arc::ptr_eq(installed, profile) {
        return false;
    }

    HOOKS.set_new_hook(Some(on_new));
    HOOKS.set_delete_hook(Some(on_delete));
    HOOKS.set_mmap_hook(Some(on_mmap));
    HOOKS.set_munmap_hook(Some(on_munmap));
    profile.set_recording(true);
    true
}

/// Stop routing events. The profile keeps what it recorded.
pub fn uninstall() {
    if let Some(profile) = target() {
        profile.set_recording(false);
    }
    HOOKS.set_new_hook(None);
    HOOKS.set_delete_hook(None);
    HOOKS.set_mmap_hook(None);
    HOOKS.set_munmap_hook(None);
}

/// Whether a profile is receiving allocator events.
pub fn is_installed() -> bool {
    target().is_some_and(HeapProfile::is_recording)
        && HOOKS.is_installed(heapcheck_hooks::HookKind::New)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_plumbing_is_recognized() {
        for name in [
            "heapcheck_hooks::hooks::HookTable::invoke_new",
            "<heapcheck_hooks::HookedAllocator<A> as core::alloc::global::GlobalAlloc>::alloc",
            "__rust_alloc",
            "__rustc::__rust_realloc",
            "alloc::alloc::exchange_malloc",
            "<alloc::alloc::Global as core::alloc::Allocator>::allocate",
            "alloc::raw_vec::RawVecInner<A>::finish_grow",
            "<alloc::boxed::Box<[u8; 64]>>::new",
        ] {
            assert!(is_allocator_symbol(name), "{name}");
        }
    }

    #[test]
    fn callers_are_not_plumbing() {
        for name in [
            "hooked_allocator::leak_is_caught",
            "example_app::cache::DataCache::get",
            "alloc::string::String::push_str",
            "<alloc::vec::Vec<T> as core::clone::Clone>::clone",
            "std::rt::lang_start",
        ] {
            assert!(!is_allocator_symbol(name), "{name}");
        }
    }

    #[inline(never)]
    fn capture_like_the_hook() -> StackTrace {
        StackTrace::capture_after_skipping(
            capture_like_the_hook as fn() -> StackTrace as usize,
            4,
            is_allocator_frame,
        )
    }

    #[test]
    fn callers_frame_is_kept_and_remembered() {
        let trace = capture_like_the_hook();
        assert!(!trace.is_empty());
        let frames = ALLOCATOR_FRAMES.lock().unwrap();
        assert!(frames.values().any(|plumbing| !plumbing));
    }
}
