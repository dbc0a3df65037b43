use super::{format_bytes, json_escape, stack_label};
use crate::dump::HeapDump;
use crate::error::Result;
use crate::process::MemoryMaps;
use crate::render::{BucketChange, offending_changes};
use std::path::Path;

const FRAMES_SHOWN: usize = 6;

/// Run the diff command. Returns whether the dumps differ.
pub fn run(begin_path: &Path, end_path: &Path, same_heap: bool, top: usize, json: bool) -> Result<bool> {
    let begin = HeapDump::read(begin_path)?;
    let end = HeapDump::read(end_path)?;
    let changes = offending_changes(&begin, &end, same_heap);
    let maps = MemoryMaps::parse(&end.maps);

    if json {
        print_json(begin_path, end_path, &begin, &end, &changes, &maps, top);
    } else {
        print_table(begin_path, end_path, &begin, &end, &changes, &maps, top);
    }

    Ok(!changes.is_empty())
}

fn print_table(
    begin_path: &Path,
    end_path: &Path,
    begin: &HeapDump,
    end: &HeapDump,
    changes: &[BucketChange],
    maps: &MemoryMaps,
    top: usize,
) {
    println!("# base: {}", begin_path.display());
    println!("# end:  {}", end_path.display());
    println!(
        "# Live bytes: {:+} | Live objects: {:+}",
        end.bytes as i64 - begin.bytes as i64,
        end.objects as i64 - begin.objects as i64
    );
    println!();

    if changes.is_empty() {
        println!("No call site changed.");
        return;
    }

    println!("{:>10}  {:>8}  ALLOCATED AT", "BYTES", "OBJECTS");
    println!("{}", "-".repeat(80));
    for change in changes.iter().take(top) {
        let bytes = if change.bytes_delta > 0 {
            format!("+{}", format_bytes(change.bytes_delta))
        } else {
            format_bytes(change.bytes_delta)
        };
        println!(
            "{:>10}  {:>+8}  {}",
            bytes,
            change.objects_delta,
            stack_label(maps, &change.stack, FRAMES_SHOWN)
        );
    }
    if changes.len() > top {
        println!("... and {} more call sites", changes.len() - top);
    }
}

fn print_json(
    begin_path: &Path,
    end_path: &Path,
    begin: &HeapDump,
    end: &HeapDump,
    changes: &[BucketChange],
    maps: &MemoryMaps,
    top: usize,
) {
    let shown = &changes[..changes.len().min(top)];
    println!("{{");
    println!("  \"base\": \"{}\",", json_escape(&begin_path.display().to_string()));
    println!("  \"end\": \"{}\",", json_escape(&end_path.display().to_string()));
    println!(
        "  \"bytes_delta\": {},",
        end.bytes as i64 - begin.bytes as i64
    );
    println!(
        "  \"objects_delta\": {},",
        end.objects as i64 - begin.objects as i64
    );
    println!("  \"discrepancy\": {},", !changes.is_empty());
    println!("  \"call_sites\": {},", changes.len());
    println!("  \"changes\": [");

    for (i, change) in shown.iter().enumerate() {
        let comma = if i < shown.len() - 1 { "," } else { "" };
        let frames: Vec<String> = change
            .stack
            .pcs()
            .iter()
            .map(|&pc| format!("\"{}\"", json_escape(&super::frame_label(maps, pc))))
            .collect();
        println!(
            "    {{ \"bytes_delta\": {}, \"objects_delta\": {}, \"stack\": [{}] }}{}",
            change.bytes_delta,
            change.objects_delta,
            frames.join(", "),
            comma
        );
    }

    println!("  ]");
    println!("}}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Bucket;
    use crate::stack::StackTrace;

    fn dump(buckets: &[(usize, usize, usize)]) -> HeapDump {
        HeapDump::new(
            buckets
                .iter()
                .map(|&(pc, objects, bytes)| Bucket {
                    stack: StackTrace::from_pcs(&[pc]),
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
    fn growth_is_offending_under_both_policies() {
        let begin = dump(&[(0x10, 1, 64)]);
        let end = dump(&[(0x10, 1, 64), (0x20, 2, 200)]);
        assert_eq!(offending_changes(&begin, &end, false).len(), 1);
        assert_eq!(offending_changes(&begin, &end, true).len(), 1);
    }

    #[test]
    fn shrinking_only_offends_same_heap() {
        let begin = dump(&[(0x10, 2, 128)]);
        let end = dump(&[(0x10, 1, 64)]);
        assert!(offending_changes(&begin, &end, false).is_empty());
        assert_eq!(offending_changes(&begin, &end, true)[0].bytes_delta, -64);
    }

    #[test]
    fn run_reports_discrepancy() {
        let dir = tempfile::tempdir().unwrap();
        let begin = dir.path().join("a.beg.heap");
        let end = dir.path().join("a.end.heap");
        dump(&[(0x10, 1, 64)]).write(&begin).unwrap();
        dump(&[(0x20, 1, 64)]).write(&end).unwrap();

        assert!(run(&begin, &end, false, 10, false).unwrap());
        assert!(!run(&begin, &begin, true, 10, true).unwrap());
    }
}
