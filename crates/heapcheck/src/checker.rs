//! Leak checkers.
//!
//! A [`LeakChecker`] takes a snapshot of the countable heap when it starts
//! and compares it with a second snapshot when one of its verification
//! methods is called:
//!
//! | method | policy | full diff | report |
//! |--------|--------|-----------|--------|
//! | [`no_leaks`](LeakChecker::no_leaks) | no growth | yes | yes |
//! | [`quick_no_leaks`](LeakChecker::quick_no_leaks) | no growth | no | yes |
//! | [`brief_no_leaks`](LeakChecker::brief_no_leaks) | no growth | no | no |
//! | [`same_heap`](LeakChecker::same_heap) | no change | yes | yes |
//! | [`quick_same_heap`](LeakChecker::quick_same_heap) | no change | no | yes |
//! | [`brief_same_heap`](LeakChecker::brief_same_heap) | no change | no | no |
//!
//! Exactly one verification is allowed per checker.
//!
//! ```rust,ignore
//! let checker = heapcheck::LeakChecker::new("parse_config");
//! parse_config(&text)?;
//! assert!(checker.no_leaks());
//! ```

use crate::analysis::{Scope, Snapshot};
use crate::context::{CheckMode, HeapCheck};
use crate::dump::{DumpKind, HeapDump, dump_path};
use crate::error::Error;
use crate::process::{self, MemoryMaps};
use crate::profile::RecordingGuard;
use crate::render::{DiffRequest, RenderOutcome};
use crate::stats::{CURRENT_ALLOCATED_BYTES, CURRENT_ALLOCATED_OBJECTS};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Passes iff neither bytes nor objects grew.
    NoLeaks,
    /// Passes iff bytes and objects are unchanged.
    SameHeap,
}

impl Policy {
    pub fn passes(self, bytes_delta: i64, objects_delta: i64) -> bool {
        match self {
            Policy::NoLeaks => bytes_delta <= 0 && objects_delta <= 0,
            Policy::SameHeap => bytes_delta == 0 && objects_delta == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckerState {
    Constructed,
    Verified,
    Cancelled,
}

/// Result of one verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub checker: String,
    pub policy: Policy,
    pub start: Snapshot,
    pub end: Snapshot,
    pub bytes_delta: i64,
    pub objects_delta: i64,
    /// Set when a full diff ran and found call sites that changed.
    pub renderer_discrepancy: Option<bool>,
    pub passed: bool,
    /// The verdict rests on less information than asked for.
    pub reduced_confidence: bool,
    pub begin_dump: Option<PathBuf>,
    pub end_dump: Option<PathBuf>,
    /// Leak report, when one was requested and the check failed.
    pub report: Option<String>,
}

/// A renderer's verdict and the command it suggests, or why it could not run.
type Rendered = std::result::Result<(RenderOutcome, String), String>;

struct Capture {
    snapshot: Snapshot,
    reduced_confidence: bool,
    dump: Option<PathBuf>,
    notes: Vec<String>,
    freed_ignored: Vec<usize>,
}

pub struct LeakChecker<'a> {
    ctx: &'a HeapCheck,
    name: String,
    scope: Scope,
    /// Inactive checkers were started with checking off and always pass.
    active: bool,
    start: Snapshot,
    start_reduced: bool,
    begin_dump: Option<PathBuf>,
    state: CheckerState,
    outcome: Option<CheckOutcome>,
}

impl LeakChecker<'static> {
    /// Start a local checker on the process-wide context.
    pub fn new(name: &str) -> Self {
        HeapCheck::global().checker(name)
    }
}

impl<'a> LeakChecker<'a> {
    pub(crate) fn start(ctx: &'a HeapCheck, name: &str, scope: Scope) -> Self {
        let name = {
            let _guard = RecordingGuard::enter();
            sanitize_name(name)
        };
        let name = match name {
            Ok(name) => name,
            Err((err, fixed)) => {
                ctx.report_usage(&err);
                fixed
            }
        };

        let mut checker = LeakChecker {
            ctx,
            name,
            scope,
            active: ctx.mode() != CheckMode::Off,
            start: Snapshot::default(),
            start_reduced: false,
            begin_dump: None,
            state: CheckerState::Constructed,
            outcome: None,
        };
        if !checker.active {
            return checker;
        }

        let capture = checker.capture(DumpKind::Begin);
        checker.start = capture.snapshot;
        checker.start_reduced = capture.reduced_confidence;
        checker.begin_dump = capture.dump;
        checker.log_capture_notes(&capture.notes, &capture.freed_ignored);
        checker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_whole_program(&self) -> bool {
        self.scope.is_whole_program()
    }

    /// Countable heap at start.
    pub fn start_snapshot(&self) -> Snapshot {
        self.start
    }

    /// Outcome of the verification, once one ran.
    pub fn outcome(&self) -> Option<&CheckOutcome> {
        self.outcome.as_ref()
    }

    pub fn begin_dump(&self) -> Option<&Path> {
        self.begin_dump.as_deref()
    }

    /// Growth of countable bytes since start, measured now, without
    /// verifying. Negative when memory was released.
    pub fn bytes_leaked(&self) -> i64 {
        let (bytes, _) = self.measure().delta_from(&self.start);
        bytes
    }

    /// Growth of countable objects since start, measured now.
    pub fn objects_leaked(&self) -> i64 {
        let (_, objects) = self.measure().delta_from(&self.start);
        objects
    }

    pub fn no_leaks(&mut self) -> bool {
        self.do_check(false, true, true)
    }

    pub fn quick_no_leaks(&mut self) -> bool {
        self.do_check(false, false, true)
    }

    pub fn brief_no_leaks(&mut self) -> bool {
        self.do_check(false, false, false)
    }

    pub fn same_heap(&mut self) -> bool {
        self.do_check(true, true, true)
    }

    pub fn quick_same_heap(&mut self) -> bool {
        self.do_check(true, false, true)
    }

    pub fn brief_same_heap(&mut self) -> bool {
        self.do_check(true, false, false)
    }

    /// Drop the checker without verifying and without complaint.
    pub fn cancel(mut self) {
        self.state = CheckerState::Cancelled;
    }

    /// Verify once. `same_heap` selects the policy, `do_full` asks the
    /// renderer to compare call sites, `do_report` logs a report on failure.
    pub fn do_check(&mut self, same_heap: bool, do_full: bool, do_report: bool) -> bool {
        if self.state != CheckerState::Constructed {
            self.ctx
                .report_usage(&Error::AlreadyVerified(self.name.clone()));
            return self.outcome.as_ref().is_none_or(|o| o.passed);
        }
        self.state = CheckerState::Verified;

        let policy = if same_heap {
            Policy::SameHeap
        } else {
            Policy::NoLeaks
        };

        if !self.active {
            info!(checker = %self.name, "heap checking is off; check skipped");
            self.outcome = Some(CheckOutcome {
                checker: self.name.clone(),
                policy,
                start: self.start,
                end: self.start,
                bytes_delta: 0,
                objects_delta: 0,
                renderer_discrepancy: None,
                passed: true,
                reduced_confidence: true,
                begin_dump: None,
                end_dump: None,
                report: None,
            });
            return true;
        }

        let report_enabled = self.ctx.with_config(|c| c.report);
        let (capture, rendered) = self.capture_end(same_heap, do_full);
        self.log_capture_notes(&capture.notes, &capture.freed_ignored);

        let (bytes_delta, objects_delta) = capture.snapshot.delta_from(&self.start);
        let mut passed = policy.passes(bytes_delta, objects_delta);
        let mut reduced_confidence = self.start_reduced || capture.reduced_confidence;

        let mut renderer_discrepancy = None;
        let mut rendered_report = None;
        let mut hint = None;
        match rendered {
            Some(Ok((outcome, command))) => {
                renderer_discrepancy = Some(outcome.discrepancy);
                passed &= !outcome.discrepancy;
                if !outcome.report.is_empty() {
                    rendered_report = Some(outcome.report);
                }
                hint = Some(command);
            }
            Some(Err(reason)) => {
                warn!(checker = %self.name, "full heap diff unavailable, using counts only: {}", reason);
                reduced_confidence = true;
            }
            None => {}
        }

        let report = (do_report && report_enabled && !passed).then(|| {
            self.leak_report(
                policy,
                bytes_delta,
                objects_delta,
                capture.dump.as_deref(),
                hint.as_deref(),
                rendered_report.as_deref(),
            )
        });
        if let Some(report) = &report {
            error!("{}", report);
        } else if passed {
            info!(
                checker = %self.name,
                bytes_delta,
                objects_delta,
                reduced_confidence,
                "no leaks found"
            );
        }

        self.outcome = Some(CheckOutcome {
            checker: self.name.clone(),
            policy,
            start: self.start,
            end: capture.snapshot,
            bytes_delta,
            objects_delta,
            renderer_discrepancy,
            passed,
            reduced_confidence,
            begin_dump: self.begin_dump.clone(),
            end_dump: capture.dump,
            report,
        });
        passed
    }

    /// Countable heap right now, without dumping.
    fn measure(&self) -> Snapshot {
        if !self.active {
            return self.start;
        }
        let profile = self.ctx.profile();
        if !profile.is_recording() {
            return self.fallback_snapshot().0;
        }
        let (snapshot, freed_ignored) = {
            let mut table = profile.lock();
            let (analysis, freed) = self.ctx.analyze(&mut table, self.scope);
            (analysis.snapshot, freed)
        };
        self.log_capture_notes(&[], &freed_ignored);
        snapshot
    }

    fn capture(&self, kind: DumpKind) -> Capture {
        self.capture_with(kind, None).0
    }

    /// End capture plus, for full checks, the renderer's verdict.
    fn capture_end(&self, same_heap: bool, do_full: bool) -> (Capture, Option<Rendered>) {
        self.capture_with(DumpKind::End, do_full.then_some(same_heap))
    }

    /// Analyze, dump, and (when `full` carries the policy) run the renderer
    /// on the begin and end dumps, all under one hold of the table lock.
    fn capture_with(&self, kind: DumpKind, full: Option<bool>) -> (Capture, Option<Rendered>) {
        let profile = self.ctx.profile();
        if !profile.is_recording() {
            let rendered = full.map(|_| Err("heap profile is not recording".to_string()));
            return (self.fallback_capture(), rendered);
        }
        if self.scope.is_whole_program() {
            self.ctx.refresh_libraries();
        }

        // Cloned under the guard so the copy never shows up in the snapshot.
        let config = {
            let _guard = RecordingGuard::enter();
            self.ctx.config()
        };
        let mut table = profile.lock();
        let (analysis, freed_ignored) = self.ctx.analyze(&mut table, self.scope);

        let mut notes = Vec::new();
        let mut reduced_confidence = false;
        if let Some(reason) = analysis.incomplete.clone() {
            notes.push(reason);
            reduced_confidence = true;
        }

        let dump = if config.dump_profiles {
            let buckets = table.buckets(|addr, record| analysis.counts(addr, record));
            let path = dump_path(
                &config.dump_directory,
                &process::invocation_name(),
                process::pid(),
                &self.name,
                kind,
            );
            let maps = MemoryMaps::for_self()
                .map(|m| m.raw().to_string())
                .unwrap_or_default();
            match HeapDump::new(buckets, maps).write(&path) {
                Ok(()) => Some(path),
                Err(e) => {
                    notes.push(format!("cannot write {}: {}", path.display(), e));
                    None
                }
            }
        } else {
            None
        };

        let rendered = full.map(|same_heap| {
            let (Some(begin), Some(end)) = (self.begin_dump.as_deref(), dump.as_deref()) else {
                return Err("heap dumps are not available".to_string());
            };
            let patterns = self.ctx.exemptions().patterns().to_vec();
            let binary = std::env::current_exe().ok();
            let renderer = self.ctx.renderer();
            let request = DiffRequest {
                checker: &self.name,
                begin,
                end,
                same_heap,
                ignore: &patterns,
                binary: binary.as_deref(),
            };
            renderer
                .diff(&request)
                .map(|outcome| (outcome, renderer.command_hint(&request)))
                .map_err(|e| e.to_string())
        });
        drop(table);

        let capture = Capture {
            snapshot: analysis.snapshot,
            reduced_confidence,
            dump,
            notes,
            freed_ignored,
        };
        (capture, rendered)
    }

    fn fallback_snapshot(&self) -> (Snapshot, bool) {
        let stats = self.ctx.stats().current();
        let bytes = stats.numeric_property(CURRENT_ALLOCATED_BYTES);
        let objects = stats.numeric_property(CURRENT_ALLOCATED_OBJECTS);
        let complete = bytes.is_some() && objects.is_some();
        (
            Snapshot {
                bytes: bytes.unwrap_or(0),
                objects: objects.unwrap_or(0),
            },
            complete,
        )
    }

    fn fallback_capture(&self) -> Capture {
        let (snapshot, complete) = self.fallback_snapshot();
        let mut notes = vec!["heap profile is not recording; using allocator counters".to_string()];
        if !complete {
            notes.push("allocator counters unavailable".to_string());
        }
        Capture {
            snapshot,
            reduced_confidence: true,
            dump: None,
            notes,
            freed_ignored: Vec::new(),
        }
    }

    fn log_capture_notes(&self, notes: &[String], freed_ignored: &[usize]) {
        for note in notes {
            warn!(checker = %self.name, "reduced confidence: {}", note);
        }
        for &addr in freed_ignored {
            self.ctx.report_usage(&Error::IgnoredObjectFreed(addr));
        }
    }

    fn leak_report(
        &self,
        policy: Policy,
        bytes_delta: i64,
        objects_delta: i64,
        end_dump: Option<&Path>,
        hint: Option<&str>,
        rendered: Option<&str>,
    ) -> String {
        let mut report = match policy {
            Policy::NoLeaks => format!(
                "heap checker '{}' found leaks: {} byte(s) in {} object(s) more than at start",
                self.name, bytes_delta, objects_delta
            ),
            Policy::SameHeap => format!(
                "heap checker '{}' found a changed heap: {:+} byte(s), {:+} object(s) since start",
                self.name, bytes_delta, objects_delta
            ),
        };
        if let (Some(begin), Some(end)) = (&self.begin_dump, end_dump) {
            report.push_str(&format!(
                "\n  begin dump: {}\n  end dump:   {}",
                begin.display(),
                end.display()
            ));
            let command = hint.map(str::to_string).unwrap_or_else(|| {
                format!("heapcheck diff {} {}", begin.display(), end.display())
            });
            report.push_str(&format!("\n  investigate with: {}", command));
        }
        if let Some(rendered) = rendered {
            report.push('\n');
            report.push_str(rendered.trim_end());
        }
        report
    }
}

impl Drop for LeakChecker<'_> {
    fn drop(&mut self) {
        if self.state == CheckerState::Constructed && self.active {
            self.ctx
                .report_usage(&Error::NeverVerified(self.name.clone()));
        }
    }
}

impl std::fmt::Debug for LeakChecker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakChecker")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("start", &self.start)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Names end up in file names: they must be non-empty and free of `/`.
/// On error, returns a usable replacement alongside.
fn sanitize_name(name: &str) -> std::result::Result<String, (Error, String)> {
    if !name.is_empty() && !name.contains('/') && !name.contains('\0') {
        return Ok(name.to_string());
    }
    let fixed: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    let fixed = if fixed.is_empty() {
        "unnamed".to_string()
    } else {
        fixed
    };
    Err((Error::InvalidName(name.to_string()), fixed))
}
