//! End-to-end checks with `HookedAllocator` as the global allocator.
//!
//! Runs without the libtest harness: the harness allocates on its own
//! threads while tests run, which would show up in every snapshot. Cases run
//! one after another on the main thread and nothing is printed inside a
//! checked interval.

use heapcheck::stats::{CURRENT_ALLOCATED_BYTES, MAPPED_BYTES, StatsRegistry};
use heapcheck::{HeapCheck, LeakChecker, Strictness, WholeProgramPolicy};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};

heapcheck::heap_checked!();

static KEPT: AtomicUsize = AtomicUsize::new(0);

fn leak_is_caught() {
    let mut checker = LeakChecker::new("leak");
    std::mem::forget(black_box(Box::new([0u8; 100])));
    assert!(!checker.brief_no_leaks());

    let outcome = checker.outcome().unwrap();
    assert_eq!(outcome.bytes_delta, 100);
    assert_eq!(outcome.objects_delta, 1);
    assert!(!outcome.reduced_confidence);
}

fn balanced_work_passes() {
    let mut checker = LeakChecker::new("balanced");
    for i in 0..50 {
        let mut v: Vec<u64> = Vec::new();
        // Growth goes through realloc.
        for j in 0..(i * 10) {
            v.push(j);
        }
        black_box(&v);
    }
    let s = black_box(format!("{}-{}", "balanced", 42));
    drop(s);
    assert!(checker.brief_same_heap());
}

fn freeing_older_memory_passes_no_leaks_only() {
    let old = black_box(Box::new([0u8; 512]));
    let mut no_leaks = LeakChecker::new("shrink");
    let mut same = LeakChecker::new("shrink_same");
    drop(old);
    assert!(no_leaks.brief_no_leaks());
    assert!(!same.brief_same_heap());
    assert_eq!(same.outcome().unwrap().bytes_delta, -512);
}

#[inline(never)]
fn leak_between_markers(ctx: &HeapCheck) {
    let start = ctx.disable_checks_start();
    std::mem::forget(black_box(Box::new([1u8; 64])));
    ctx.disable_checks_to_here_from(start).unwrap();
}

fn disabled_call_sites_are_exempt() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.checker("disabled");
    leak_between_markers(ctx);
    assert!(checker.brief_no_leaks());
}

#[inline(never)]
fn leak_after_markers(ctx: &HeapCheck) {
    let start = ctx.disable_checks_start();
    black_box(Box::new(0u8));
    ctx.disable_checks_to_here_from(start).unwrap();
    std::mem::forget(black_box(Box::new([6u8; 72])));
}

fn allocation_after_end_marker_is_caught() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.checker("after_markers");
    leak_after_markers(ctx);
    assert!(!checker.brief_no_leaks());
    assert_eq!(checker.outcome().unwrap().bytes_delta, 72);
}

#[inline(never)]
fn leak_directly(ctx: &HeapCheck, max_depth: usize) {
    let start = ctx.disable_checks_start();
    std::mem::forget(black_box(Box::new([4u8; 80])));
    let end = ctx.disable_checks_start();
    ctx.disable_range(start, end, max_depth).unwrap();
}

#[inline(never)]
fn leak_one() {
    std::mem::forget(black_box(Box::new([5u8; 40])));
}

#[inline(never)]
fn leak_through_helper(ctx: &HeapCheck, max_depth: usize) {
    let start = ctx.disable_checks_start();
    leak_one();
    let end = ctx.disable_checks_start();
    ctx.disable_range(start, end, max_depth).unwrap();
}

fn depth_limited_ranges_start_at_the_caller() {
    let ctx = HeapCheck::global();
    for depth in [1, 2] {
        let mut checker = ctx.checker("depth_direct");
        leak_directly(ctx, depth);
        assert!(checker.brief_no_leaks(), "depth {depth}: {:?}", checker.outcome());
    }

    // One frame deeper: the helper's own frame comes first.
    let mut shallow = ctx.checker("depth_helper_1");
    leak_through_helper(ctx, 1);
    assert!(!shallow.brief_no_leaks());
    assert_eq!(shallow.outcome().unwrap().bytes_delta, 40);

    let mut deep = ctx.checker("depth_helper_2");
    leak_through_helper(ctx, 2);
    assert!(deep.brief_no_leaks(), "{:?}", deep.outcome());
}

#[inline(never)]
fn leak_after_disabling_up(ctx: &HeapCheck) {
    ctx.disable_checks_up(1).unwrap();
    std::mem::forget(black_box(Box::new([8u8; 56])));
}

fn disable_checks_up_covers_the_calling_function() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.checker("disabled_up");
    leak_after_disabling_up(ctx);
    assert!(checker.brief_no_leaks(), "{:?}", checker.outcome());
}

fn ignored_object_is_not_a_leak() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.whole_program_checker("ignored", WholeProgramPolicy::DRACONIAN);
    let cache: &'static mut Vec<u32> = heapcheck::leak(Box::new(Vec::with_capacity(16)));
    black_box(&cache);
    // The vector's buffer is reachable from the ignored box.
    assert!(checker.brief_same_heap());
}

fn unreachable_leak_counts_without_roots() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.whole_program_checker("unrooted", WholeProgramPolicy::MINIMAL);
    std::mem::forget(black_box(Box::new([2u8; 48])));
    assert!(!checker.brief_no_leaks());
}

#[inline(never)]
fn drop_pointers() {
    for _ in 0..16 {
        std::mem::forget(black_box(Box::new([7u8; 96])));
    }
}

fn unreachable_leak_fails_with_roots() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.whole_program_checker("rooted", WholeProgramPolicy::NORMAL);
    drop_pointers();
    assert!(!checker.brief_no_leaks());
    assert!(checker.outcome().unwrap().bytes_delta > 0);
}

fn globals_keep_objects_alive() {
    let ctx = HeapCheck::global();
    let mut checker = ctx.whole_program_checker("global_root", WholeProgramPolicy::NORMAL);
    let object = black_box(Box::new([3u8; 256]));
    KEPT.store(Box::into_raw(object) as usize, Ordering::SeqCst);
    let passed = checker.brief_no_leaks();
    assert!(passed, "{:?}", checker.outcome());
}

fn stats_follow_the_profile() {
    let stats = StatsRegistry::instance();
    let before = stats.numeric_property(CURRENT_ALLOCATED_BYTES).unwrap();
    let buffer = black_box(vec![0u8; 4096]);
    let during = stats.numeric_property(CURRENT_ALLOCATED_BYTES).unwrap();
    assert!(during >= before + 4096);
    drop(buffer);

    let len = 1 << 16;
    let mapped_before = stats.numeric_property(MAPPED_BYTES).unwrap();
    // SAFETY: fresh anonymous mapping, unmapped right after.
    unsafe {
        let addr = heapcheck_hooks::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(addr, libc::MAP_FAILED);
        assert_eq!(stats.numeric_property(MAPPED_BYTES).unwrap(), mapped_before + len);
        heapcheck_hooks::munmap(addr, len);
    }
    assert_eq!(stats.numeric_property(MAPPED_BYTES).unwrap(), mapped_before);
}

fn whole_program_entry_points_are_public() {
    let _start: fn(Strictness) -> bool = heapcheck::start_from_main;
    // Never started in this binary, so there is nothing to fail.
    assert!(heapcheck::no_global_leaks());
}

fn main() {
    assert!(heapcheck::install());
    HeapCheck::global().update_config(|c| c.dump_profiles = false);

    let cases: &[(&str, fn())] = &[
        // First, while every recorded object is reachable.
        ("globals_keep_objects_alive", globals_keep_objects_alive),
        (
            "unreachable_leak_fails_with_roots",
            unreachable_leak_fails_with_roots,
        ),
        ("leak_is_caught", leak_is_caught),
        ("balanced_work_passes", balanced_work_passes),
        (
            "freeing_older_memory_passes_no_leaks_only",
            freeing_older_memory_passes_no_leaks_only,
        ),
        ("disabled_call_sites_are_exempt", disabled_call_sites_are_exempt),
        (
            "allocation_after_end_marker_is_caught",
            allocation_after_end_marker_is_caught,
        ),
        (
            "depth_limited_ranges_start_at_the_caller",
            depth_limited_ranges_start_at_the_caller,
        ),
        (
            "disable_checks_up_covers_the_calling_function",
            disable_checks_up_covers_the_calling_function,
        ),
        ("ignored_object_is_not_a_leak", ignored_object_is_not_a_leak),
        (
            "unreachable_leak_counts_without_roots",
            unreachable_leak_counts_without_roots,
        ),
        ("stats_follow_the_profile", stats_follow_the_profile),
        (
            "whole_program_entry_points_are_public",
            whole_program_entry_points_are_public,
        ),
    ];

    for (name, case) in cases {
        case();
        println!("test {} ... ok", name);
    }
    println!("\ntest result: ok. {} passed", cases.len());
}
