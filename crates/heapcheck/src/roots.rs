//! Where reachability starts.
//!
//! A [`RootSource`] feeds root memory into a [`LiveSet`]. The process source
//! scans global data of every loaded object, the calling thread's stack, and
//! the stacks of all other threads (stopped for the duration). Tests use
//! [`ExplicitRoots`] to scan buffers they own.

use crate::error::Result;
use crate::liveness::LiveSet;
use crate::process::{MemoryMapping, MemoryMaps};
use crate::threads::{self, SuspendedThreads};
use std::time::Duration;

/// A readable address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a root scan covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootReport {
    pub regions: usize,
    pub bytes: usize,
    pub threads_scanned: usize,
    /// Threads whose stacks could not be scanned. Anything only they
    /// reference may be reported as leaked.
    pub threads_missed: usize,
}

pub trait RootSource: Send + Sync {
    /// Mark every object in `live` reachable from this source's roots and
    /// propagate. Must not allocate once other threads are stopped.
    fn mark_roots(&self, live: &mut LiveSet, suspend_timeout: Duration) -> Result<RootReport>;
}

/// Roots of the running process.
#[derive(Debug, Default)]
pub struct ProcessRoots;

impl RootSource for ProcessRoots {
    fn mark_roots(&self, live: &mut LiveSet, suspend_timeout: Duration) -> Result<RootReport> {
        // Everything that allocates happens before any thread is stopped.
        let maps = MemoryMaps::for_self()?;
        let globals = global_data_regions(&maps);
        let tids = threads::other_threads()?;

        let mut report = RootReport::default();
        for region in &globals {
            // SAFETY: private writable mappings of loaded objects stay mapped
            // while their object is loaded; nothing unloads during a check.
            unsafe { live.scan_region(region.start, region.end) };
            report.regions += 1;
            report.bytes += region.len();
        }

        let stopped = SuspendedThreads::stop(&tids, suspend_timeout)?;

        if let Some(region) = current_stack(&maps) {
            // SAFETY: our own stack, from a live frame up to its top.
            unsafe { live.scan_region(region.start, region.end) };
            report.regions += 1;
            report.bytes += region.len();
        }

        for sp in stopped.stack_pointers() {
            if let Some(region) = stack_region(&maps, sp) {
                // SAFETY: the owning thread is parked inside the frame at
                // `sp`, so everything above it is mapped and stable.
                unsafe { live.scan_region(region.start, region.end) };
                report.regions += 1;
                report.bytes += region.len();
                report.threads_scanned += 1;
            } else {
                report.threads_missed += 1;
            }
        }
        report.threads_missed += stopped.missed();

        // Closure is computed while the other threads cannot move pointers.
        live.propagate();
        drop(stopped);
        Ok(report)
    }
}

/// Caller-provided root regions.
#[derive(Debug, Clone, Default)]
pub struct ExplicitRoots {
    regions: Vec<Region>,
}

impl ExplicitRoots {
    /// # Safety
    ///
    /// Every region must stay mapped and readable for as long as this
    /// source is in use.
    pub unsafe fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl RootSource for ExplicitRoots {
    fn mark_roots(&self, live: &mut LiveSet, _suspend_timeout: Duration) -> Result<RootReport> {
        let mut report = RootReport::default();
        for region in &self.regions {
            // SAFETY: guaranteed by the constructor's contract.
            unsafe { live.scan_region(region.start, region.end) };
            report.regions += 1;
            report.bytes += region.len();
        }
        live.propagate();
        Ok(report)
    }
}

/// Writable data of every loaded object: private, file-backed, writable
/// mappings plus the anonymous mapping directly after one (its `.bss`).
pub fn global_data_regions(maps: &MemoryMaps) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut previous: Option<&MemoryMapping> = None;

    for mapping in maps.mappings() {
        let data = is_data(mapping);
        let bss = previous.is_some_and(|prev| is_data(prev) && prev.end == mapping.start)
            && mapping.pathname.is_none()
            && mapping.is_readable()
            && mapping.is_writable()
            && mapping.is_private();

        if data || bss {
            regions.push(Region {
                start: mapping.start,
                end: mapping.end,
            });
        }
        previous = Some(mapping);
    }
    regions
}

fn is_data(mapping: &MemoryMapping) -> bool {
    mapping.is_readable() && mapping.is_writable() && mapping.is_private() && mapping.is_file_backed()
}

/// From `sp` to the top of the mapping holding it.
pub fn stack_region(maps: &MemoryMaps, sp: usize) -> Option<Region> {
    let mapping = maps.containing(sp)?;
    Some(Region {
        start: sp,
        end: mapping.end,
    })
}

#[inline(never)]
fn current_stack(maps: &MemoryMaps) -> Option<Region> {
    let marker = 0usize;
    let sp = std::hint::black_box(&marker) as *const usize as usize;
    stack_region(maps, sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 1234 /usr/bin/app
55d0c0a90000-55d0c0a94000 rw-p 00090000 08:01 1234 /usr/bin/app
55d0c0a94000-55d0c0a98000 rw-p 00000000 00:00 0
55d0c1000000-55d0c1200000 rw-p 00000000 00:00 0 [heap]
7f2a00000000-7f2a00100000 rw-p 00000000 00:00 0
7f2a10190000-7f2a10194000 rw-p 00190000 08:01 99 /usr/lib/libc.so.6
7f2a10194000-7f2a101a0000 r--p 00000000 00:00 0
7ffd5c000000-7ffd5c021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn globals_are_data_and_following_bss() {
        let maps = MemoryMaps::parse(SAMPLE);
        let regions = global_data_regions(&maps);
        assert_eq!(
            regions,
            vec![
                Region { start: 0x55d0c0a90000, end: 0x55d0c0a94000 },
                Region { start: 0x55d0c0a94000, end: 0x55d0c0a98000 },
                Region { start: 0x7f2a10190000, end: 0x7f2a10194000 },
            ]
        );
    }

    #[test]
    fn stack_region_runs_to_mapping_end() {
        let maps = MemoryMaps::parse(SAMPLE);
        let region = stack_region(&maps, 0x7ffd5c020000).unwrap();
        assert_eq!(region.end, 0x7ffd5c021000);
        assert_eq!(region.len(), 0x1000);
        assert!(stack_region(&maps, 0x10).is_none());
    }

    #[test]
    fn explicit_roots_mark_what_they_point_to() {
        let reachable = Box::new([0usize; 4]);
        let unreachable = Box::new([0usize; 4]);
        let holder = Box::new([&*reachable as *const _ as usize]);

        let mut live = LiveSet::new([
            (&*reachable as *const _ as usize, 32),
            (&*unreachable as *const _ as usize, 32),
        ]);
        let start = &*holder as *const _ as usize;
        let roots = unsafe {
            ExplicitRoots::new(vec![Region {
                start,
                end: start + std::mem::size_of::<usize>(),
            }])
        };
        let report = roots.mark_roots(&mut live, Duration::ZERO).unwrap();

        assert_eq!(report.regions, 1);
        assert!(live.is_marked(&*reachable as *const _ as usize));
        assert!(!live.is_marked(&*unreachable as *const _ as usize));
    }

    #[test]
    fn process_roots_see_a_global() {
        static mut HOLDER: usize = 0;
        let object = Box::new([7u64; 8]);
        let addr = &*object as *const _ as usize;
        unsafe { HOLDER = addr };

        let mut live = LiveSet::new([(addr, 64)]);
        let report = ProcessRoots
            .mark_roots(&mut live, Duration::from_secs(2))
            .unwrap();
        assert!(report.regions > 0);
        assert!(live.is_marked(addr));
        unsafe { HOLDER = 0 };
    }
}
