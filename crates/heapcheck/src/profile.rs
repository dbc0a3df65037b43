//! The in-process heap profile table.
//!
//! Every live allocation is keyed by address and points at an interned call
//! stack. Per-stack cumulative counters feed the dump writer. The table's
//! mutex is also the checker's pause lock: while a thread holds it, no other
//! thread can record an allocation or a free.

use crate::stack::StackTrace;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Index into the interned stack list.
pub type StackId = u32;

/// Number of power-of-two size classes in [`ProfileTable::size_histogram`].
pub const HISTOGRAM_SIZE: usize = 64;

thread_local! {
    static RECORDING_SUSPENDED: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as busy inside the checker.
///
/// While set, the allocation hooks drop this thread's events on the floor.
/// That keeps the checker's own bookkeeping out of the profile and lets it
/// allocate while holding the table lock without re-entering it.
///
/// Memory that *was* recorded must not be freed while the guard is held, or
/// its record outlives it.
pub(crate) struct RecordingGuard {
    was_set: bool,
}

impl RecordingGuard {
    /// Enter unconditionally. Nested guards restore the outer state on drop.
    pub(crate) fn enter() -> Self {
        let was_set = RECORDING_SUSPENDED
            .try_with(|flag| flag.replace(true))
            .unwrap_or(true);
        RecordingGuard { was_set }
    }

    /// Enter only if the thread is not already inside the checker.
    pub(crate) fn try_enter() -> Option<Self> {
        let was_set = RECORDING_SUSPENDED
            .try_with(|flag| flag.replace(true))
            .unwrap_or(true);
        if was_set {
            None
        } else {
            Some(RecordingGuard { was_set })
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active() -> bool {
        RECORDING_SUSPENDED.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        let was_set = self.was_set;
        let _ = RECORDING_SUSPENDED.try_with(|flag| flag.set(was_set));
    }
}

/// A lock guard that also holds the recording guard for its lifetime.
pub struct Locked<'a, T> {
    // Declared first so the lock is released before recording resumes.
    inner: MutexGuard<'a, T>,
    _recording: RecordingGuard,
}

impl<'a, T> Locked<'a, T> {
    pub(crate) fn lock(mutex: &'a Mutex<T>) -> Self {
        let recording = RecordingGuard::enter();
        let inner = mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Locked {
            inner,
            _recording: recording,
        }
    }
}

impl<T> Deref for Locked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// One live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub size: usize,
    pub stack: StackId,
    /// Registered through `ignore_object`.
    pub ignored: bool,
}

#[derive(Debug, Clone)]
struct StackEntry {
    trace: StackTrace,
    live_objects: usize,
    live_bytes: usize,
    allocs: usize,
    alloc_bytes: usize,
}

/// Table-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub allocs: usize,
    pub alloc_bytes: usize,
    pub frees: usize,
}

/// All live allocations sharing one call stack, plus what that stack has
/// allocated over the table's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub stack: StackTrace,
    pub objects: usize,
    pub bytes: usize,
    pub allocs: usize,
    pub alloc_bytes: usize,
}

#[derive(Debug)]
pub struct ProfileTable {
    allocs: BTreeMap<usize, AllocRecord>,
    stacks: Vec<StackEntry>,
    stack_index: BTreeMap<StackTrace, StackId>,
    totals: Totals,
    mapped_bytes: usize,
    ignored_freed: Vec<usize>,
}

impl ProfileTable {
    pub const fn new() -> Self {
        Self {
            allocs: BTreeMap::new(),
            stacks: Vec::new(),
            stack_index: BTreeMap::new(),
            totals: Totals {
                live_objects: 0,
                live_bytes: 0,
                allocs: 0,
                alloc_bytes: 0,
                frees: 0,
            },
            mapped_bytes: 0,
            ignored_freed: Vec::new(),
        }
    }

    fn intern(&mut self, trace: &StackTrace) -> StackId {
        if let Some(&id) = self.stack_index.get(trace) {
            return id;
        }
        let id = self.stacks.len() as StackId;
        self.stacks.push(StackEntry {
            trace: *trace,
            live_objects: 0,
            live_bytes: 0,
            allocs: 0,
            alloc_bytes: 0,
        });
        self.stack_index.insert(*trace, id);
        id
    }

    pub fn insert(&mut self, addr: usize, size: usize, trace: &StackTrace) {
        // A block we never saw freed (its free happened while recording was
        // suspended) is being handed out again.
        if self.allocs.contains_key(&addr) {
            self.remove(addr);
        }

        let id = self.intern(trace);
        let entry = &mut self.stacks[id as usize];
        entry.live_objects += 1;
        entry.live_bytes += size;
        entry.allocs += 1;
        entry.alloc_bytes += size;

        self.totals.live_objects += 1;
        self.totals.live_bytes += size;
        self.totals.allocs += 1;
        self.totals.alloc_bytes += size;

        self.allocs.insert(
            addr,
            AllocRecord {
                size,
                stack: id,
                ignored: false,
            },
        );
    }

    pub fn remove(&mut self, addr: usize) -> Option<AllocRecord> {
        let record = self.allocs.remove(&addr)?;
        let entry = &mut self.stacks[record.stack as usize];
        entry.live_objects -= 1;
        entry.live_bytes -= record.size;

        self.totals.live_objects -= 1;
        self.totals.live_bytes -= record.size;
        self.totals.frees += 1;

        if record.ignored {
            self.ignored_freed.push(addr);
        }
        Some(record)
    }

    pub fn get(&self, addr: usize) -> Option<&AllocRecord> {
        self.allocs.get(&addr)
    }

    pub fn is_live(&self, addr: usize) -> bool {
        self.allocs.contains_key(&addr)
    }

    /// Flag or unflag a live object as ignored. Returns false if `addr` is
    /// not a live allocation.
    pub fn set_ignored(&mut self, addr: usize, ignored: bool) -> bool {
        match self.allocs.get_mut(&addr) {
            Some(record) => {
                record.ignored = ignored;
                true
            }
            None => false,
        }
    }

    /// Ignored objects freed since the last call.
    pub fn take_ignored_freed(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.ignored_freed)
    }

    pub fn live(&self) -> impl Iterator<Item = (usize, &AllocRecord)> + '_ {
        self.allocs.iter().map(|(&addr, record)| (addr, record))
    }

    pub fn live_count(&self) -> usize {
        self.allocs.len()
    }

    pub fn stack(&self, id: StackId) -> &StackTrace {
        &self.stacks[id as usize].trace
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    pub fn add_mapping(&mut self, len: usize) {
        self.mapped_bytes = self.mapped_bytes.saturating_add(len);
    }

    pub fn remove_mapping(&mut self, len: usize) {
        self.mapped_bytes = self.mapped_bytes.saturating_sub(len);
    }

    /// Per-stack buckets of the live objects for which `keep` returns true,
    /// largest first. Cumulative counters are reported as recorded.
    pub fn buckets(&self, mut keep: impl FnMut(usize, &AllocRecord) -> bool) -> Vec<Bucket> {
        let mut live: BTreeMap<StackId, (usize, usize)> = BTreeMap::new();
        for (&addr, record) in &self.allocs {
            if keep(addr, record) {
                let slot = live.entry(record.stack).or_default();
                slot.0 += 1;
                slot.1 += record.size;
            }
        }

        let mut buckets: Vec<Bucket> = live
            .into_iter()
            .map(|(id, (objects, bytes))| {
                let entry = &self.stacks[id as usize];
                Bucket {
                    stack: entry.trace,
                    objects,
                    bytes,
                    allocs: entry.allocs,
                    alloc_bytes: entry.alloc_bytes,
                }
            })
            .collect();
        buckets.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.stack.cmp(&b.stack)));
        buckets
    }

    /// Count of live objects by power-of-two size class.
    pub fn size_histogram(&self) -> [usize; HISTOGRAM_SIZE] {
        let mut histogram = [0; HISTOGRAM_SIZE];
        for record in self.allocs.values() {
            let class = if record.size == 0 {
                0
            } else {
                (usize::BITS - record.size.leading_zeros()) as usize
            };
            histogram[class.min(HISTOGRAM_SIZE - 1)] += 1;
        }
        histogram
    }

    /// Forget every record. Interned stacks are kept.
    pub fn clear(&mut self) {
        self.allocs.clear();
        for entry in &mut self.stacks {
            entry.live_objects = 0;
            entry.live_bytes = 0;
        }
        self.totals.live_objects = 0;
        self.totals.live_bytes = 0;
        self.ignored_freed.clear();
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A heap profile: the table plus its recording switches.
#[derive(Debug)]
pub struct HeapProfile {
    table: Mutex<ProfileTable>,
    recording: AtomicBool,
    max_stack_depth: AtomicUsize,
}

impl HeapProfile {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(ProfileTable::new()),
            recording: AtomicBool::new(false),
            max_stack_depth: AtomicUsize::new(crate::stack::MAX_STACK_DEPTH),
        }
    }

    /// Lock the table. Holding the result pauses every recording thread.
    pub fn lock(&self) -> Locked<'_, ProfileTable> {
        Locked::lock(&self.table)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Release);
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth.load(Ordering::Relaxed)
    }

    pub fn set_max_stack_depth(&self, depth: usize) {
        self.max_stack_depth.store(
            depth.clamp(1, crate::stack::MAX_STACK_DEPTH),
            Ordering::Relaxed,
        );
    }

    /// Record a new allocation. Ignored while recording is off.
    pub fn record_alloc(&self, addr: usize, size: usize, stack: &StackTrace) {
        if !self.is_recording() {
            return;
        }
        self.lock().insert(addr, size, stack);
    }

    /// Record a free. Unknown addresses are ignored.
    pub fn record_free(&self, addr: usize) -> Option<AllocRecord> {
        if !self.is_recording() {
            return None;
        }
        self.lock().remove(addr)
    }

    pub fn record_mmap(&self, len: usize) {
        if self.is_recording() {
            self.lock().add_mapping(len);
        }
    }

    pub fn record_munmap(&self, len: usize) {
        if self.is_recording() {
            self.lock().remove_mapping(len);
        }
    }
}

impl Default for HeapProfile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(pcs: &[usize]) -> StackTrace {
        StackTrace::from_pcs(pcs)
    }

    fn recording() -> HeapProfile {
        let profile = HeapProfile::new();
        profile.set_recording(true);
        profile
    }

    #[test]
    fn tracks_live_objects_and_totals() {
        let profile = recording();
        profile.record_alloc(0x1000, 100, &stack(&[1, 2]));
        profile.record_alloc(0x2000, 50, &stack(&[1, 2]));
        profile.record_alloc(0x3000, 10, &stack(&[3]));
        profile.record_free(0x2000);

        let table = profile.lock();
        let totals = table.totals();
        assert_eq!(totals.live_objects, 2);
        assert_eq!(totals.live_bytes, 110);
        assert_eq!(totals.allocs, 3);
        assert_eq!(totals.alloc_bytes, 160);
        assert_eq!(totals.frees, 1);
        assert!(table.is_live(0x1000));
        assert!(!table.is_live(0x2000));
    }

    #[test]
    fn off_means_nothing_recorded() {
        let profile = HeapProfile::new();
        profile.record_alloc(0x1000, 8, &stack(&[1]));
        assert_eq!(profile.lock().live_count(), 0);
    }

    #[test]
    fn reused_address_replaces_stale_record() {
        let profile = recording();
        profile.record_alloc(0x1000, 8, &stack(&[1]));
        profile.record_alloc(0x1000, 24, &stack(&[2]));

        let table = profile.lock();
        assert_eq!(table.totals().live_objects, 1);
        assert_eq!(table.totals().live_bytes, 24);
    }

    #[test]
    fn buckets_sorted_by_bytes() {
        let profile = recording();
        profile.record_alloc(0x1000, 8, &stack(&[1]));
        profile.record_alloc(0x2000, 64, &stack(&[2]));
        profile.record_alloc(0x3000, 64, &stack(&[2]));

        let buckets = profile.lock().buckets(|_, _| true);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].stack, stack(&[2]));
        assert_eq!(buckets[0].objects, 2);
        assert_eq!(buckets[0].bytes, 128);

        let filtered = profile.lock().buckets(|addr, _| addr != 0x1000);
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn freeing_ignored_object_is_remembered() {
        let profile = recording();
        profile.record_alloc(0x1000, 8, &stack(&[1]));
        assert!(profile.lock().set_ignored(0x1000, true));
        profile.record_free(0x1000);

        assert_eq!(profile.lock().take_ignored_freed(), vec![0x1000]);
        assert!(profile.lock().take_ignored_freed().is_empty());
    }

    #[test]
    fn histogram_groups_by_power_of_two() {
        let profile = recording();
        profile.record_alloc(0x1000, 1, &stack(&[1]));
        profile.record_alloc(0x2000, 100, &stack(&[1]));
        profile.record_alloc(0x3000, 127, &stack(&[1]));

        let histogram = profile.lock().size_histogram();
        assert_eq!(histogram[1], 1);
        assert_eq!(histogram[7], 2);
    }

    #[test]
    fn recording_guard_nests() {
        assert!(!RecordingGuard::is_active());
        {
            let _outer = RecordingGuard::enter();
            assert!(RecordingGuard::try_enter().is_none());
            {
                let _inner = RecordingGuard::enter();
            }
            assert!(RecordingGuard::is_active());
        }
        assert!(!RecordingGuard::is_active());
    }
}
