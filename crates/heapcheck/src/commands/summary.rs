use super::{format_bytes, format_count, stack_label};
use crate::dump::{DumpName, HeapDump};
use crate::error::Result;
use crate::process::MemoryMaps;
use comfy_table::{CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use std::path::Path;

const FRAMES_SHOWN: usize = 4;

/// Largest call sites of a dump as a table.
pub fn top_table(dump: &HeapDump, top: usize) -> Table {
    let maps = MemoryMaps::parse(&dump.maps);
    let mut buckets: Vec<_> = dump.buckets.iter().collect();
    buckets.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| b.objects.cmp(&a.objects)));

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["LIVE BYTES", "OBJECTS", "ALLOCS", "ALLOCATED AT"]);
    for bucket in buckets.iter().take(top) {
        table.add_row(vec![
            format_bytes(bucket.bytes as i64),
            format_count(bucket.objects as u64),
            format_count(bucket.allocs as u64),
            stack_label(&maps, &bucket.stack, FRAMES_SHOWN),
        ]);
    }
    for index in 0..3 {
        if let Some(column) = table.column_mut(index) {
            column.set_cell_alignment(CellAlignment::Right);
        }
    }
    table
}

/// Run the summary command
pub fn run(path: &Path, top: usize) -> Result<()> {
    let dump = HeapDump::read(path)?;

    println!("# {}", path.display());
    if let Some(name) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(DumpName::parse)
    {
        println!(
            "# {} (pid {}) | checker: {} | {}",
            name.invocation,
            name.pid,
            name.checker,
            name.kind.suffix()
        );
    }
    println!(
        "# Live: {} in {} objects | Allocated: {} in {} allocations | Call sites: {}",
        format_bytes(dump.bytes as i64),
        format_count(dump.objects as u64),
        format_bytes(dump.alloc_bytes as i64),
        format_count(dump.allocs as u64),
        dump.buckets.len()
    );
    println!();

    if dump.buckets.is_empty() {
        println!("No live allocations recorded.");
        return Ok(());
    }
    println!("{}", top_table(&dump, top));
    if dump.buckets.len() > top {
        println!("... and {} more call sites", dump.buckets.len() - top);
    }

    Ok(())
}
