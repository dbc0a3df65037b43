//! Heap dump files.
//!
//! The text format is the classic heap-profile layout:
//!
//! ```text
//! heap profile: 3: 160 [7: 480] @ heap
//! 2: 128 [4: 256] @ 0x55d0c0a21234 0x55d0c0a20111
//! 1: 32 [3: 224] @ 0x55d0c0a22222
//!
//! MAPPED_LIBRARIES:
//! 55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 1234 /usr/bin/app
//! ```
//!
//! Each bucket line is `live objects: live bytes [allocs: alloc bytes]`
//! followed by the call stack, innermost frame first.

use crate::error::{Error, Result};
use crate::profile::Bucket;
use crate::stack::StackTrace;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const HEADER_PREFIX: &str = "heap profile:";
const MAPS_MARKER: &str = "MAPPED_LIBRARIES:";

/// Which end of a checked interval a dump belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Begin,
    End,
}

impl DumpKind {
    pub fn suffix(self) -> &'static str {
        match self {
            DumpKind::Begin => "beg",
            DumpKind::End => "end",
        }
    }
}

/// `<dir>/<invocation>.<pid>.<name>-<beg|end>.heap`
pub fn dump_path(dir: &Path, invocation: &str, pid: u32, name: &str, kind: DumpKind) -> PathBuf {
    dir.join(format!(
        "{}.{}.{}-{}.heap",
        invocation,
        pid,
        name,
        kind.suffix()
    ))
}

/// Parts of a dump file name produced by [`dump_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpName {
    pub invocation: String,
    pub pid: u32,
    pub checker: String,
    pub kind: DumpKind,
}

impl DumpName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".heap")?;
        let (rest, kind) = if let Some(rest) = stem.strip_suffix("-beg") {
            (rest, DumpKind::Begin)
        } else {
            (stem.strip_suffix("-end")?, DumpKind::End)
        };

        // Invocation names may contain dots; the pid is the first all-digit
        // component after it.
        let parts: Vec<&str> = rest.split('.').collect();
        let pid_index = (1..parts.len().saturating_sub(1))
            .find(|&i| !parts[i].is_empty() && parts[i].bytes().all(|b| b.is_ascii_digit()))?;
        Some(DumpName {
            invocation: parts[..pid_index].join("."),
            pid: parts[pid_index].parse().ok()?,
            checker: parts[pid_index + 1..].join("."),
            kind,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapDump {
    pub objects: usize,
    pub bytes: usize,
    pub allocs: usize,
    pub alloc_bytes: usize,
    pub buckets: Vec<Bucket>,
    /// Raw `/proc/self/maps` text of the process that wrote the dump.
    pub maps: String,
}

impl HeapDump {
    pub fn new(buckets: Vec<Bucket>, maps: String) -> Self {
        let mut dump = HeapDump {
            buckets,
            maps,
            ..Default::default()
        };
        for bucket in &dump.buckets {
            dump.objects += bucket.objects;
            dump.bytes += bucket.bytes;
            dump.allocs += bucket.allocs;
            dump.alloc_bytes += bucket.alloc_bytes;
        }
        dump
    }

    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            out,
            "{} {}: {} [{}: {}] @ heap",
            HEADER_PREFIX, self.objects, self.bytes, self.allocs, self.alloc_bytes
        )?;
        for bucket in &self.buckets {
            write!(
                out,
                "{}: {} [{}: {}] @",
                bucket.objects, bucket.bytes, bucket.allocs, bucket.alloc_bytes
            )?;
            for pc in bucket.stack.pcs() {
                write!(out, " {:#x}", pc)?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
        writeln!(out, "{}", MAPS_MARKER)?;
        out.write_all(self.maps.as_bytes())?;
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|reason| Error::Dump {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut lines = content.lines();
        let header = lines.next().ok_or("empty file")?;
        let header = header
            .strip_prefix(HEADER_PREFIX)
            .ok_or("missing 'heap profile:' header")?;
        let (counts, tail) = header.split_once('@').ok_or("header has no '@'")?;
        if tail.trim() != "heap" {
            return Err(format!("unsupported profile type '{}'", tail.trim()));
        }
        let (objects, bytes, allocs, alloc_bytes) = parse_counts(counts)?;

        let mut dump = HeapDump {
            objects,
            bytes,
            allocs,
            alloc_bytes,
            ..Default::default()
        };

        for (number, line) in lines.by_ref().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == MAPS_MARKER {
                break;
            }
            dump.buckets
                .push(parse_bucket(line).map_err(|e| format!("line {}: {}", number + 2, e))?);
        }

        // Everything after the marker is kept byte for byte.
        if let Some(pos) = content.find(MAPS_MARKER) {
            let rest = &content[pos + MAPS_MARKER.len()..];
            dump.maps = rest.strip_prefix('\n').unwrap_or(rest).to_string();
        }

        Ok(dump)
    }
}

/// `a: b [c: d]`
fn parse_counts(text: &str) -> std::result::Result<(usize, usize, usize, usize), String> {
    let (live, total) = text
        .split_once('[')
        .ok_or_else(|| format!("expected '[' in '{}'", text.trim()))?;
    let total = total
        .trim()
        .strip_suffix(']')
        .ok_or_else(|| format!("expected ']' in '{}'", text.trim()))?;
    let (objects, bytes) = parse_pair(live)?;
    let (allocs, alloc_bytes) = parse_pair(total)?;
    Ok((objects, bytes, allocs, alloc_bytes))
}

fn parse_pair(text: &str) -> std::result::Result<(usize, usize), String> {
    let (a, b) = text
        .split_once(':')
        .ok_or_else(|| format!("expected 'count: bytes', got '{}'", text.trim()))?;
    let a = a.trim().parse().map_err(|_| format!("bad count '{}'", a.trim()))?;
    let b = b.trim().parse().map_err(|_| format!("bad byte count '{}'", b.trim()))?;
    Ok((a, b))
}

fn parse_bucket(line: &str) -> std::result::Result<Bucket, String> {
    let (counts, frames) = line.split_once('@').ok_or("bucket line has no '@'")?;
    let (objects, bytes, allocs, alloc_bytes) = parse_counts(counts)?;
    let pcs = frames
        .split_whitespace()
        .map(|f| {
            let hex = f.strip_prefix("0x").unwrap_or(f);
            usize::from_str_radix(hex, 16).map_err(|_| format!("bad frame address '{}'", f))
        })
        .collect::<std::result::Result<Vec<usize>, String>>()?;
    Ok(Bucket {
        stack: StackTrace::from_pcs(&pcs),
        objects,
        bytes,
        allocs,
        alloc_bytes,
    })
}
