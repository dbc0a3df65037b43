//! Profile renderers: compare a begin dump with an end dump.
//!
//! Counts alone cannot see a leak hidden behind an equal-sized free
//! elsewhere. A renderer looks at where the live objects were allocated and
//! flags call sites whose footprint changed.

use crate::dump::HeapDump;
use crate::error::{Error, Result};
use crate::profile::Bucket;
use crate::stack::{StackTrace, symbol_name};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Everything a renderer needs for one comparison.
#[derive(Debug, Clone, Copy)]
pub struct DiffRequest<'a> {
    pub checker: &'a str,
    pub begin: &'a Path,
    pub end: &'a Path,
    /// Any change is a discrepancy, not just growth.
    pub same_heap: bool,
    /// Buckets with a frame whose symbol matches are skipped.
    pub ignore: &'a [Regex],
    /// The executable the dumps came from.
    pub binary: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub discrepancy: bool,
    pub report: String,
}

pub trait ProfileRenderer: Send + Sync {
    fn name(&self) -> &str;

    fn diff(&self, request: &DiffRequest<'_>) -> Result<RenderOutcome>;

    /// Command a person can run to investigate the same two dumps.
    fn command_hint(&self, request: &DiffRequest<'_>) -> String;
}

/// Pick the renderer for a configuration: the external tool when one is
/// configured and present, otherwise the built-in bucket diff.
pub fn select(pprof_path: Option<&Path>) -> Box<dyn ProfileRenderer> {
    match pprof_path {
        Some(path) if path.is_file() => Box::new(ExternalRenderer::new(path)),
        _ => Box::new(BucketDiffRenderer::default()),
    }
}

/// Runs an external pprof-compatible tool:
/// `<tool> --base=<begin> [--ignore=<pattern>]... <binary> <end>`.
///
/// Exit status 0 means no discrepancy and 1 means discrepancy; anything else
/// means the tool could not do the job.
#[derive(Debug, Clone)]
pub struct ExternalRenderer {
    tool: PathBuf,
}

impl ExternalRenderer {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    fn args(&self, request: &DiffRequest<'_>) -> Vec<String> {
        let mut args = vec![format!("--base={}", request.begin.display())];
        for pattern in request.ignore {
            args.push(format!("--ignore={}", pattern.as_str()));
        }
        if let Some(binary) = request.binary {
            args.push(binary.display().to_string());
        }
        args.push(request.end.display().to_string());
        args
    }
}

impl ProfileRenderer for ExternalRenderer {
    fn name(&self) -> &str {
        "external"
    }

    fn diff(&self, request: &DiffRequest<'_>) -> Result<RenderOutcome> {
        let output = Command::new(&self.tool)
            .args(self.args(request))
            .output()
            .map_err(|e| Error::Renderer(format!("cannot run {}: {}", self.tool.display(), e)))?;

        let mut report = String::from_utf8_lossy(&output.stdout).into_owned();
        report.push_str(&String::from_utf8_lossy(&output.stderr));
        match output.status.code() {
            Some(0) => Ok(RenderOutcome {
                discrepancy: false,
                report,
            }),
            Some(1) => Ok(RenderOutcome {
                discrepancy: true,
                report,
            }),
            code => Err(Error::Renderer(format!(
                "{} exited with {}",
                self.tool.display(),
                code.map_or_else(|| "a signal".to_string(), |c| format!("status {}", c))
            ))),
        }
    }

    fn command_hint(&self, request: &DiffRequest<'_>) -> String {
        let mut hint = self.tool.display().to_string();
        for arg in self.args(request) {
            hint.push(' ');
            hint.push_str(&arg);
        }
        hint
    }
}

/// A call site whose live footprint changed between two dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketChange {
    pub stack: StackTrace,
    pub objects_delta: i64,
    pub bytes_delta: i64,
}

/// Call sites that make two dumps differ under the chosen policy: any change
/// for same-heap, growth only otherwise.
pub fn offending_changes(begin: &HeapDump, end: &HeapDump, same_heap: bool) -> Vec<BucketChange> {
    bucket_changes(begin, end)
        .into_iter()
        .filter(|c| same_heap || c.objects_delta > 0 || c.bytes_delta > 0)
        .collect()
}

/// Per-call-site comparison of two dumps.
pub fn bucket_changes(begin: &HeapDump, end: &HeapDump) -> Vec<BucketChange> {
    let mut footprint: BTreeMap<StackTrace, (i64, i64)> = BTreeMap::new();
    for bucket in &begin.buckets {
        let slot = footprint.entry(bucket.stack).or_default();
        slot.0 -= bucket.objects as i64;
        slot.1 -= bucket.bytes as i64;
    }
    for bucket in &end.buckets {
        let slot = footprint.entry(bucket.stack).or_default();
        slot.0 += bucket.objects as i64;
        slot.1 += bucket.bytes as i64;
    }

    let mut changes: Vec<BucketChange> = footprint
        .into_iter()
        .filter(|&(_, (objects, bytes))| objects != 0 || bytes != 0)
        .map(|(stack, (objects_delta, bytes_delta))| BucketChange {
            stack,
            objects_delta,
            bytes_delta,
        })
        .collect();
    changes.sort_by(|a, b| b.bytes_delta.cmp(&a.bytes_delta).then_with(|| a.stack.cmp(&b.stack)));
    changes
}

/// Compares dumps bucket by bucket, in process.
#[derive(Debug, Clone)]
pub struct BucketDiffRenderer {
    /// Frames symbolized per reported bucket.
    pub frames_shown: usize,
    /// Buckets listed in the report.
    pub buckets_shown: usize,
}

impl Default for BucketDiffRenderer {
    fn default() -> Self {
        Self {
            frames_shown: 8,
            buckets_shown: 10,
        }
    }
}

impl BucketDiffRenderer {
    /// Decide and describe the difference between two loaded dumps.
    pub fn compare(
        &self,
        begin: &HeapDump,
        end: &HeapDump,
        same_heap: bool,
        ignore: &[Regex],
    ) -> RenderOutcome {
        let offending: Vec<BucketChange> = offending_changes(begin, end, same_heap)
            .into_iter()
            .filter(|c| ignore.is_empty() || !matches_any(&c.stack, ignore))
            .collect();

        let mut report = String::new();
        if offending.is_empty() {
            return RenderOutcome {
                discrepancy: false,
                report,
            };
        }

        let grown: i64 = offending.iter().map(|c| c.bytes_delta.max(0)).sum();
        let _ = writeln!(
            report,
            "{} call site(s) changed, {} byte(s) of growth:",
            offending.len(),
            grown
        );
        for change in offending.iter().take(self.buckets_shown) {
            let _ = writeln!(
                report,
                "  {:+} object(s), {:+} byte(s) allocated at:",
                change.objects_delta, change.bytes_delta
            );
            for &pc in change.stack.pcs().iter().take(self.frames_shown) {
                match symbol_name(pc) {
                    Some(name) => {
                        let _ = writeln!(report, "    {:#x} {}", pc, name);
                    }
                    None => {
                        let _ = writeln!(report, "    {:#x}", pc);
                    }
                }
            }
        }
        if offending.len() > self.buckets_shown {
            let _ = writeln!(report, "  ... and {} more", offending.len() - self.buckets_shown);
        }

        RenderOutcome {
            discrepancy: true,
            report,
        }
    }
}

impl ProfileRenderer for BucketDiffRenderer {
    fn name(&self) -> &str {
        "bucket-diff"
    }

    fn diff(&self, request: &DiffRequest<'_>) -> Result<RenderOutcome> {
        let begin = HeapDump::read(request.begin)?;
        let end = HeapDump::read(request.end)?;
        Ok(self.compare(&begin, &end, request.same_heap, request.ignore))
    }

    fn command_hint(&self, request: &DiffRequest<'_>) -> String {
        format!(
            "heapcheck diff {}{} {}",
            if request.same_heap { "--same-heap " } else { "" },
            request.begin.display(),
            request.end.display()
        )
    }
}

fn matches_any(stack: &StackTrace, patterns: &[Regex]) -> bool {
    stack
        .pcs()
        .iter()
        .filter_map(|&pc| symbol_name(pc))
        .any(|name| patterns.iter().any(|p| p.is_match(&name)))
}

/// Total live bytes and objects of a dump's buckets.
pub fn footprint(buckets: &[Bucket]) -> (usize, usize) {
    buckets
        .iter()
        .fold((0, 0), |(objects, bytes), b| (objects + b.objects, bytes + b.bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(buckets: &[(&[usize], usize, usize)]) -> HeapDump {
        HeapDump::new(
            buckets
                .iter()
                .map(|&(pcs, objects, bytes)| Bucket {
                    stack: StackTrace::from_pcs(pcs),
                    objects,
                    bytes,
                    allocs: objects,
                    alloc_bytes: bytes,
                })
                .collect(),
            String::new(),
        )
    }

    #[test]
    fn shrinking_offends_only_same_heap() {
        let begin = dump(&[(&[1, 2], 2, 128), (&[3], 1, 16)]);
        let end = dump(&[(&[1, 2], 1, 64), (&[3], 1, 16)]);
        assert!(offending_changes(&begin, &end, false).is_empty());
        assert_eq!(offending_changes(&begin, &end, true).len(), 1);

        let renderer = BucketDiffRenderer::default();
        assert!(!renderer.compare(&begin, &end, false, &[]).discrepancy);
        assert!(renderer.compare(&begin, &end, true, &[]).discrepancy);
    }

    #[test]
    fn identical_dumps_agree() {
        let a = dump(&[(&[1, 2], 3, 300)]);
        let outcome = BucketDiffRenderer::default().compare(&a, &a.clone(), true, &[]);
        assert!(!outcome.discrepancy);
        assert!(outcome.report.is_empty());
    }

    #[test]
    fn swap_between_call_sites_is_caught() {
        // Same totals, different owners.
        let begin = dump(&[(&[1], 1, 64), (&[2], 0, 0)]);
        let end = dump(&[(&[1], 0, 0), (&[2], 1, 64)]);
        assert_eq!(footprint(&begin.buckets), footprint(&end.buckets));

        let renderer = BucketDiffRenderer::default();
        let outcome = renderer.compare(&begin, &end, false, &[]);
        assert!(outcome.discrepancy);
        assert!(outcome.report.contains("+1 object(s), +64 byte(s)"));
        assert!(renderer.compare(&begin, &end, true, &[]).discrepancy);
    }

    #[test]
    fn shrinking_only_fails_same_heap() {
        let begin = dump(&[(&[1], 2, 64)]);
        let end = dump(&[(&[1], 1, 32)]);
        let renderer = BucketDiffRenderer::default();
        assert!(!renderer.compare(&begin, &end, false, &[]).discrepancy);
        assert!(renderer.compare(&begin, &end, true, &[]).discrepancy);
    }

    #[test]
    fn changes_sorted_by_growth() {
        let begin = dump(&[]);
        let end = dump(&[(&[1], 1, 8), (&[2], 1, 800)]);
        let changes = bucket_changes(&begin, &end);
        assert_eq!(changes[0].bytes_delta, 800);
        assert_eq!(changes[1].bytes_delta, 8);
    }

    #[test]
    fn external_tool_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let begin = dir.path().join("a-beg.heap");
        let end = dir.path().join("a-end.heap");
        let request = DiffRequest {
            checker: "a",
            begin: &begin,
            end: &end,
            same_heap: false,
            ignore: &[],
            binary: None,
        };

        let clean = ExternalRenderer::new("/bin/true").diff(&request).unwrap();
        assert!(!clean.discrepancy);
        let leaky = ExternalRenderer::new("/bin/false").diff(&request).unwrap();
        assert!(leaky.discrepancy);
        assert!(ExternalRenderer::new(dir.path().join("missing")).diff(&request).is_err());
    }

    #[test]
    fn hints_name_both_dumps() {
        let ignore = [Regex::new("^cache::").unwrap()];
        let request = DiffRequest {
            checker: "a",
            begin: Path::new("/tmp/a-beg.heap"),
            end: Path::new("/tmp/a-end.heap"),
            same_heap: true,
            ignore: &ignore,
            binary: Some(Path::new("/bin/app")),
        };
        assert_eq!(
            ExternalRenderer::new("/usr/bin/pprof").command_hint(&request),
            "/usr/bin/pprof --base=/tmp/a-beg.heap --ignore=^cache:: /bin/app /tmp/a-end.heap"
        );
        assert_eq!(
            BucketDiffRenderer::default().command_hint(&request),
            "heapcheck diff --same-heap /tmp/a-beg.heap /tmp/a-end.heap"
        );
    }

    #[test]
    fn selects_builtin_without_tool() {
        assert_eq!(select(None).name(), "bucket-diff");
        assert_eq!(select(Some(Path::new("/nonexistent/pprof"))).name(), "bucket-diff");
    }
}
