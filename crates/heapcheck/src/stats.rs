//! Allocator statistics facade.
//!
//! Code that wants numbers about the heap asks [`StatsRegistry::instance`]
//! and gets whatever backend was registered last, or [`NoopStats`] if none
//! was. Every method has a "no data" default so backends only implement
//! what they can answer.

use crate::profile::{HISTOGRAM_SIZE, HeapProfile};
use arc_swap::ArcSwap;
use std::fmt::Write as _;
use std::sync::Arc;

pub const CURRENT_ALLOCATED_BYTES: &str = "generic.current_allocated_bytes";
pub const CURRENT_ALLOCATED_OBJECTS: &str = "generic.current_allocated_objects";
pub const HEAP_SIZE: &str = "generic.heap_size";
pub const MAPPED_BYTES: &str = "heapcheck.mapped_bytes";
pub const MAX_STACK_DEPTH: &str = "heapcheck.max_stack_depth";

/// Snapshot of the live heap by size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub blocks: usize,
    pub total: usize,
    /// `histogram[i]` counts live objects whose size needs `i` bits.
    pub histogram: [usize; HISTOGRAM_SIZE],
}

pub trait AllocatorStats: Send + Sync {
    fn numeric_property(&self, _name: &str) -> Option<usize> {
        None
    }

    /// Returns false if the property is unknown or read-only.
    fn set_numeric_property(&self, _name: &str, _value: usize) -> bool {
        false
    }

    /// Human-readable summary written into `buf`, nul-terminated and
    /// truncated to fit.
    fn stats(&self, buf: &mut [u8]) {
        write_c_string(buf, "");
    }

    /// Append a text rendering of the live heap to `out`.
    fn heap_sample(&self, out: &mut String) {
        if let Some(records) = self.read_stack_traces() {
            render_stack_records(&records, out);
        }
    }

    /// Flat `count, size, depth, pc...` records terminated by a zero count.
    fn read_stack_traces(&self) -> Option<Vec<usize>> {
        None
    }

    /// Check allocator consistency. True when nothing is known to be wrong.
    fn verify_all_memory(&self) -> bool {
        true
    }

    fn verify_memory(&self, _ptr: *const u8) -> bool {
        true
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        None
    }
}

/// The backend used when nothing else is registered.
#[derive(Debug, Default)]
pub struct NoopStats;

impl AllocatorStats for NoopStats {}

/// Holder for the active backend.
pub struct StatsRegistry {
    current: ArcSwap<Box<dyn AllocatorStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        let noop: Box<dyn AllocatorStats> = Box::new(NoopStats);
        Self {
            current: ArcSwap::from_pointee(noop),
        }
    }

    /// The active backend of the process-wide checker.
    pub fn instance() -> Arc<Box<dyn AllocatorStats>> {
        crate::context::HeapCheck::global().stats().current()
    }

    pub fn current(&self) -> Arc<Box<dyn AllocatorStats>> {
        self.current.load_full()
    }

    /// Make `backend` the active one. The last registration wins.
    pub fn register(&self, backend: Box<dyn AllocatorStats>) {
        self.current.store(Arc::new(backend));
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRegistry").finish_non_exhaustive()
    }
}

/// Statistics answered from a heap profile table.
#[derive(Debug, Clone)]
pub struct ProfileStats {
    profile: Arc<HeapProfile>,
}

impl ProfileStats {
    pub fn new(profile: Arc<HeapProfile>) -> Self {
        Self { profile }
    }
}

impl AllocatorStats for ProfileStats {
    fn numeric_property(&self, name: &str) -> Option<usize> {
        match name {
            CURRENT_ALLOCATED_BYTES => Some(self.profile.lock().totals().live_bytes),
            CURRENT_ALLOCATED_OBJECTS => Some(self.profile.lock().totals().live_objects),
            MAPPED_BYTES => Some(self.profile.lock().mapped_bytes()),
            HEAP_SIZE => {
                let table = self.profile.lock();
                Some(table.totals().live_bytes + table.mapped_bytes())
            }
            MAX_STACK_DEPTH => Some(self.profile.max_stack_depth()),
            _ => None,
        }
    }

    fn set_numeric_property(&self, name: &str, value: usize) -> bool {
        match name {
            MAX_STACK_DEPTH => {
                self.profile.set_max_stack_depth(value);
                true
            }
            _ => false,
        }
    }

    fn stats(&self, buf: &mut [u8]) {
        let mut text = String::new();
        {
            let table = self.profile.lock();
            let totals = table.totals();
            let _ = writeln!(
                text,
                "live:   {:>12} objects {:>14} bytes",
                totals.live_objects, totals.live_bytes
            );
            let _ = writeln!(
                text,
                "total:  {:>12} allocs  {:>14} bytes {:>12} frees",
                totals.allocs, totals.alloc_bytes, totals.frees
            );
            let _ = writeln!(text, "mapped: {:>35} bytes", table.mapped_bytes());
        }
        write_c_string(buf, &text);
    }

    fn read_stack_traces(&self) -> Option<Vec<usize>> {
        let table = self.profile.lock();
        let mut records = Vec::with_capacity(table.live_count() * 4 + 1);
        for (_, record) in table.live() {
            let pcs = table.stack(record.stack).pcs();
            records.push(1);
            records.push(record.size);
            records.push(pcs.len());
            records.extend_from_slice(pcs);
        }
        records.push(0);
        Some(records)
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        let table = self.profile.lock();
        let totals = table.totals();
        Some(MemoryStats {
            blocks: totals.live_objects,
            total: totals.live_bytes,
            histogram: table.size_histogram(),
        })
    }
}

/// Copy `text` into `buf` as a C string, truncating to fit.
fn write_c_string(buf: &mut [u8], text: &str) {
    let Some(room) = buf.len().checked_sub(1) else {
        return;
    };
    let len = text.len().min(room);
    buf[..len].copy_from_slice(&text.as_bytes()[..len]);
    buf[len] = 0;
}

/// Render flat stack records as `heap profile:`-style sample lines.
fn render_stack_records(records: &[usize], out: &mut String) {
    let mut objects = 0;
    let mut bytes = 0;
    let mut body = String::new();

    let mut i = 0;
    while i + 2 < records.len() && records[i] != 0 {
        let (count, size, depth) = (records[i], records[i + 1], records[i + 2]);
        let end = (i + 3 + depth).min(records.len());
        objects += count;
        bytes += size;
        let _ = write!(body, "{}: {} [{}: {}] @", count, size, count, size);
        for pc in &records[i + 3..end] {
            let _ = write!(body, " {:#x}", pc);
        }
        body.push('\n');
        i = end;
    }

    let _ = writeln!(
        out,
        "heap profile: {}: {} [{}: {}] @ heap",
        objects, bytes, objects, bytes
    );
    out.push_str(&body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackTrace;

    fn profile_with(objects: &[(usize, usize)]) -> Arc<HeapProfile> {
        let profile = Arc::new(HeapProfile::new());
        profile.set_recording(true);
        for &(addr, size) in objects {
            profile.record_alloc(addr, size, &StackTrace::from_pcs(&[0xabc, 0xdef]));
        }
        profile
    }

    #[test]
    fn noop_answers_nothing() {
        let stats = NoopStats;
        assert_eq!(stats.numeric_property(CURRENT_ALLOCATED_BYTES), None);
        assert!(!stats.set_numeric_property(MAX_STACK_DEPTH, 4));
        assert!(stats.read_stack_traces().is_none());
        assert!(stats.verify_all_memory());

        let mut buf = [0xffu8; 4];
        stats.stats(&mut buf);
        assert_eq!(buf[0], 0);

        let mut sample = String::new();
        stats.heap_sample(&mut sample);
        assert!(sample.is_empty());
    }

    #[test]
    fn stats_into_empty_buffer_is_noop() {
        let stats = ProfileStats::new(profile_with(&[(0x10, 4)]));
        stats.stats(&mut []);
    }

    #[test]
    fn stats_truncates_and_terminates() {
        let stats = ProfileStats::new(profile_with(&[(0x10, 4)]));
        let mut buf = [0xffu8; 8];
        stats.stats(&mut buf);
        assert_eq!(buf[7], 0);
        assert!(buf[..7].iter().all(|&b| b != 0));
    }

    #[test]
    fn registry_last_registration_wins() {
        let registry = StatsRegistry::new();
        assert_eq!(registry.current().numeric_property(CURRENT_ALLOCATED_BYTES), None);

        registry.register(Box::new(ProfileStats::new(profile_with(&[(0x10, 4)]))));
        registry.register(Box::new(ProfileStats::new(profile_with(&[
            (0x10, 4),
            (0x20, 6),
        ]))));
        let current = registry.current();
        assert_eq!(current.numeric_property(CURRENT_ALLOCATED_BYTES), Some(10));
        assert_eq!(current.numeric_property(CURRENT_ALLOCATED_OBJECTS), Some(2));
        assert_eq!(current.numeric_property(HEAP_SIZE), Some(10));
    }

    #[test]
    fn heap_size_counts_mapped_memory() {
        let profile = profile_with(&[(0x10, 100)]);
        profile.record_mmap(4096);
        let stats = ProfileStats::new(Arc::clone(&profile));
        assert_eq!(stats.numeric_property(HEAP_SIZE), Some(4196));

        profile.record_munmap(4096);
        assert_eq!(stats.numeric_property(HEAP_SIZE), Some(100));
    }

    #[test]
    fn stack_depth_is_writable() {
        let profile = profile_with(&[]);
        let stats = ProfileStats::new(Arc::clone(&profile));
        assert!(stats.set_numeric_property(MAX_STACK_DEPTH, 8));
        assert_eq!(profile.max_stack_depth(), 8);
        assert!(!stats.set_numeric_property(CURRENT_ALLOCATED_BYTES, 1));
    }

    #[test]
    fn stack_records_end_with_sentinel() {
        let stats = ProfileStats::new(profile_with(&[(0x10, 4), (0x20, 6)]));
        let records = stats.read_stack_traces().unwrap();
        assert_eq!(records, vec![1, 4, 2, 0xabc, 0xdef, 1, 6, 2, 0xabc, 0xdef, 0]);

        let mut sample = String::new();
        stats.heap_sample(&mut sample);
        assert!(sample.starts_with("heap profile: 2: 10 [2: 10] @ heap\n"));
        assert!(sample.contains("1: 4 [1: 4] @ 0xabc 0xdef"));
    }

    #[test]
    fn memory_stats_reports_histogram() {
        let stats = ProfileStats::new(profile_with(&[(0x10, 4), (0x20, 6)]));
        let memory = stats.memory_stats().unwrap();
        assert_eq!(memory.blocks, 2);
        assert_eq!(memory.total, 10);
        assert_eq!(memory.histogram[3], 2);
    }
}
