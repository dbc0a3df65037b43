//! `mmap`/`munmap` wrappers that report to the map hooks.
//!
//! Rust code cannot portably interpose the libc symbols themselves, so
//! callers that want their mappings observed go through these instead.

use crate::hooks::{HOOKS, HookTable};
use core::ffi::{c_int, c_void};

/// Map memory and report the mapping to [`HOOKS`].
///
/// # Safety
///
/// Same contract as `libc::mmap`.
pub unsafe fn mmap(
    start: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    unsafe { mmap_with(&HOOKS, start, len, prot, flags, fd, offset) }
}

/// Unmap memory, reporting to [`HOOKS`] first.
///
/// # Safety
///
/// Same contract as `libc::munmap`.
pub unsafe fn munmap(start: *mut c_void, len: usize) -> c_int {
    unsafe { munmap_with(&HOOKS, start, len) }
}

/// [`mmap`] against an explicit hook table.
///
/// The hook fires after the syscall, whether or not it succeeded, so the
/// observer sees `MAP_FAILED` too.
///
/// # Safety
///
/// Same contract as `libc::mmap`.
pub unsafe fn mmap_with(
    hooks: &HookTable,
    start: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let result = unsafe { libc::mmap(start, len, prot, flags, fd, offset) };
    hooks.invoke_mmap(
        result as *const u8,
        start as *const u8,
        len,
        prot,
        flags,
        fd,
        offset as i64,
    );
    result
}

/// [`munmap`] against an explicit hook table.
///
/// # Safety
///
/// Same contract as `libc::munmap`.
pub unsafe fn munmap_with(hooks: &HookTable, start: *mut c_void, len: usize) -> c_int {
    hooks.invoke_munmap(start as *const u8, len);
    unsafe { libc::munmap(start, len) }
}
