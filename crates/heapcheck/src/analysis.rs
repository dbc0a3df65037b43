//! One exemption pass over a paused profile table.
//!
//! An analysis decides, for every live allocation, whether it counts toward
//! the snapshot. It runs with the table lock held, and a checker computes
//! its start and end snapshots the same way so the two are comparable.

use crate::exemptions::Exemptions;
use crate::liveness::LiveSet;
use crate::profile::{AllocRecord, ProfileTable, StackId};
use crate::roots::{RootReport, RootSource};
use crate::whole_program::LiveRoots;
use std::time::Duration;

/// What a check treats as alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Between two points chosen by the caller. Only disabled ranges apply.
    Local,
    /// Process-wide, with library regions, ignored objects and (depending on
    /// the roots) reachability.
    WholeProgram(LiveRoots),
}

impl Scope {
    pub fn is_whole_program(self) -> bool {
        matches!(self, Scope::WholeProgram(_))
    }
}

/// Heap footprint that counts toward a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: usize,
    pub objects: usize,
}

impl Snapshot {
    /// `(bytes, objects)` growth from `start` to `self`.
    pub fn delta_from(&self, start: &Snapshot) -> (i64, i64) {
        (
            self.bytes as i64 - start.bytes as i64,
            self.objects as i64 - start.objects as i64,
        )
    }
}

/// The exempt/counted split of one pass.
#[derive(Debug)]
pub struct Analysis {
    pub snapshot: Snapshot,
    pub exempt_objects: usize,
    pub roots: Option<RootReport>,
    /// Set when reachability could not be computed in full.
    pub incomplete: Option<String>,
    scope: Scope,
    disabled: Vec<Option<bool>>,
    live: Option<LiveSet>,
}

impl Analysis {
    /// Whether the allocation at `addr` counts as potentially leaked.
    pub fn counts(&self, addr: usize, record: &AllocRecord) -> bool {
        if self.scope.is_whole_program() && record.ignored {
            return false;
        }
        if self
            .disabled
            .get(record.stack as usize)
            .copied()
            .flatten()
            .unwrap_or(false)
        {
            return false;
        }
        !self.live.as_ref().is_some_and(|live| live.is_marked(addr))
    }
}

/// Run the exemption pass. `table` must be locked for the duration.
pub fn analyze(
    table: &ProfileTable,
    exemptions: &Exemptions,
    scope: Scope,
    roots: &dyn RootSource,
    suspend_timeout: Duration,
) -> Analysis {
    let disabled = disabled_stacks(table, exemptions, scope);

    let mut analysis = Analysis {
        snapshot: Snapshot::default(),
        exempt_objects: 0,
        roots: None,
        incomplete: None,
        scope,
        disabled,
        live: None,
    };

    if let Scope::WholeProgram(live_roots @ (LiveRoots::IgnoredOnly | LiveRoots::All)) = scope {
        let mut live = LiveSet::new(table.live().map(|(addr, record)| (addr, record.size)));
        for addr in exemptions.ignored() {
            live.mark(addr);
        }
        if live_roots == LiveRoots::All {
            match roots.mark_roots(&mut live, suspend_timeout) {
                Ok(report) => {
                    if report.threads_missed > 0 {
                        analysis.incomplete = Some(format!(
                            "{} thread(s) did not stop in time; their stacks were not scanned",
                            report.threads_missed
                        ));
                    }
                    analysis.roots = Some(report);
                }
                Err(e) => {
                    analysis.incomplete = Some(format!("root scan failed: {}", e));
                }
            }
        }
        live.propagate();
        analysis.live = Some(live);
    }

    let mut snapshot = Snapshot::default();
    let mut exempt = 0;
    for (addr, record) in table.live() {
        if analysis.counts(addr, record) {
            snapshot.bytes += record.size;
            snapshot.objects += 1;
        } else {
            exempt += 1;
        }
    }
    analysis.snapshot = snapshot;
    analysis.exempt_objects = exempt;
    analysis
}

/// Per interned stack: `Some(true)` if exempt by call site. Only stacks of
/// live objects are evaluated.
fn disabled_stacks(table: &ProfileTable, exemptions: &Exemptions, scope: Scope) -> Vec<Option<bool>> {
    let mut disabled: Vec<Option<bool>> = Vec::new();
    for (_, record) in table.live() {
        let id = record.stack as usize;
        if id >= disabled.len() {
            disabled.resize(id + 1, None);
        }
        if disabled[id].is_none() {
            disabled[id] = Some(stack_disabled(table, exemptions, scope, record.stack));
        }
    }
    disabled
}

fn stack_disabled(table: &ProfileTable, exemptions: &Exemptions, scope: Scope, id: StackId) -> bool {
    let stack = table.stack(id);
    exemptions.is_disabled(stack) || (scope.is_whole_program() && exemptions.in_system_library(stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::{ExplicitRoots, Region};
    use crate::stack::StackTrace;

    fn table(objects: &[(usize, usize, &[usize])]) -> ProfileTable {
        let mut table = ProfileTable::new();
        for &(addr, size, pcs) in objects {
            table.insert(addr, size, &StackTrace::from_pcs(pcs));
        }
        table
    }

    #[test]
    fn local_scope_counts_everything_not_disabled() {
        let table = table(&[(0x1000, 100, &[0x10]), (0x2000, 50, &[0x20])]);
        let mut ex = Exemptions::new();
        ex.disable_range(0x20, 0x21, 1).unwrap();

        let analysis = analyze(&table, &ex, Scope::Local, &ExplicitRoots::none(), Duration::ZERO);
        assert_eq!(analysis.snapshot, Snapshot { bytes: 100, objects: 1 });
        assert_eq!(analysis.exempt_objects, 1);
    }

    #[test]
    fn ignored_flag_only_applies_to_whole_program() {
        let mut table = table(&[(0x1000, 100, &[0x10])]);
        table.set_ignored(0x1000, true);
        let ex = Exemptions::new();

        let local = analyze(&table, &ex, Scope::Local, &ExplicitRoots::none(), Duration::ZERO);
        assert_eq!(local.snapshot.objects, 1);

        let whole = analyze(
            &table,
            &ex,
            Scope::WholeProgram(LiveRoots::None),
            &ExplicitRoots::none(),
            Duration::ZERO,
        );
        assert_eq!(whole.snapshot.objects, 0);
    }

    #[test]
    fn ignored_objects_protect_what_they_reach() {
        let child = Box::new([0usize; 2]);
        let parent = Box::new([&*child as *const _ as usize, 0]);
        let orphan = Box::new([0usize; 2]);
        let child_addr = &*child as *const _ as usize;
        let parent_addr = &*parent as *const _ as usize;
        let orphan_addr = &*orphan as *const _ as usize;

        let mut table = table(&[
            (parent_addr, 16, &[1]),
            (child_addr, 16, &[2]),
            (orphan_addr, 16, &[3]),
        ]);
        table.set_ignored(parent_addr, true);
        let mut ex = Exemptions::new();
        ex.ignore(parent_addr).unwrap();

        let analysis = analyze(
            &table,
            &ex,
            Scope::WholeProgram(LiveRoots::IgnoredOnly),
            &ExplicitRoots::none(),
            Duration::ZERO,
        );
        assert_eq!(analysis.snapshot, Snapshot { bytes: 16, objects: 1 });
        assert!(analysis.counts(orphan_addr, table.get(orphan_addr).unwrap()));
        assert!(!analysis.counts(child_addr, table.get(child_addr).unwrap()));
    }

    #[test]
    fn roots_exempt_reachable_objects() {
        let object = Box::new([0u8; 32]);
        let addr = &*object as *const _ as usize;
        let root = [addr];
        let table = table(&[(addr, 32, &[1])]);

        let roots = unsafe {
            ExplicitRoots::new(vec![Region {
                start: root.as_ptr() as usize,
                end: root.as_ptr() as usize + std::mem::size_of::<usize>(),
            }])
        };
        let analysis = analyze(
            &table,
            &Exemptions::new(),
            Scope::WholeProgram(LiveRoots::All),
            &roots,
            Duration::ZERO,
        );
        assert_eq!(analysis.snapshot.objects, 0);
        assert_eq!(analysis.roots.unwrap().regions, 1);
    }

    #[test]
    fn deltas_are_signed() {
        let start = Snapshot { bytes: 100, objects: 2 };
        let end = Snapshot { bytes: 40, objects: 3 };
        assert_eq!(end.delta_from(&start), (-60, 1));
    }
}
