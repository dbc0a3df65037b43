use super::{format_bytes, format_count};
use crate::dump::{DumpKind, DumpName, HeapDump};
use crate::error::Result;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Dump info extracted from a dump file and its name
pub struct DumpInfo {
    pub path: PathBuf,
    pub name: DumpName,
    pub objects: usize,
    pub bytes: usize,
    pub modified: Option<DateTime<Local>>,
}

/// Find all heap dumps in a directory, most recent first. Files that look
/// like dumps but do not parse are skipped.
pub fn find_dumps(dir: &Path) -> Result<Vec<DumpInfo>> {
    let mut dumps = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(DumpName::parse)
        else {
            continue;
        };
        let Ok(dump) = HeapDump::read(&path) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Local>::from);
        dumps.push(DumpInfo {
            path,
            name,
            objects: dump.objects,
            bytes: dump.bytes,
            modified,
        });
    }

    dumps.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(dumps)
}

/// The end dump matching a begin dump, if it was written.
pub fn partner(begin: &Path) -> Option<PathBuf> {
    let file_name = begin.file_name()?.to_str()?;
    let name = DumpName::parse(file_name)?;
    if name.kind != DumpKind::Begin {
        return None;
    }
    let end = begin.with_file_name(format!(
        "{}-end.heap",
        file_name.strip_suffix("-beg.heap")?
    ));
    end.is_file().then_some(end)
}

/// Run the list command
pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
    let dumps = find_dumps(&search_dir)?;

    if dumps.is_empty() {
        println!("No heap dumps found in {}", search_dir.display());
        return Ok(());
    }

    println!(
        "{:<48} {:>8} {:<12} {:>4} {:>10} {:>10}  MODIFIED",
        "FILE", "PID", "CHECKER", "END", "OBJECTS", "BYTES"
    );
    println!("{}", "-".repeat(112));

    for dump in dumps {
        let filename = dump
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let modified = dump
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        println!(
            "{:<48} {:>8} {:<12} {:>4} {:>10} {:>10}  {}",
            filename,
            dump.name.pid,
            dump.name.checker,
            dump.name.kind.suffix(),
            format_count(dump.objects as u64),
            format_bytes(dump.bytes as i64),
            modified
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{DumpKind, dump_path};

    #[test]
    fn finds_dumps_and_partners() {
        let dir = tempfile::tempdir().unwrap();
        let begin = dump_path(dir.path(), "app", 42, "t1", DumpKind::Begin);
        let end = dump_path(dir.path(), "app", 42, "t1", DumpKind::End);
        HeapDump::default().write(&begin).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a dump").unwrap();
        std::fs::write(dir.path().join("app.7.bad-end.heap"), "garbage").unwrap();

        assert_eq!(partner(&begin), None);
        HeapDump::default().write(&end).unwrap();
        assert_eq!(partner(&begin), Some(end.clone()));
        assert_eq!(partner(&end), None);

        let dumps = find_dumps(dir.path()).unwrap();
        assert_eq!(dumps.len(), 2);
        assert!(dumps.iter().all(|d| d.name.checker == "t1" && d.name.pid == 42));
    }
}
