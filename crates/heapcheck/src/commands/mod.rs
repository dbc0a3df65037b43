pub mod diff;
pub mod list;
pub mod summary;

use crate::process::MemoryMaps;
use crate::stack::StackTrace;

/// Format bytes in human-readable form, keeping the sign.
pub(crate) fn format_bytes(bytes: i64) -> String {
    let abs = bytes.unsigned_abs() as f64;
    let sign = if bytes < 0 { "-" } else { "" };
    if abs >= 1024.0 * 1024.0 * 1024.0 {
        format!("{}{:.2}G", sign, abs / (1024.0 * 1024.0 * 1024.0))
    } else if abs >= 1024.0 * 1024.0 {
        format!("{}{:.2}M", sign, abs / (1024.0 * 1024.0))
    } else if abs >= 1024.0 {
        format!("{}{:.1}K", sign, abs / 1024.0)
    } else {
        format!("{}{}B", sign, bytes.unsigned_abs())
    }
}

/// Format a number with commas for readability
pub(crate) fn format_count(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Name a frame by the object file it falls in, `libfoo.so+0x1a2b`.
/// Dumps come from another process, so symbols cannot be resolved here.
pub(crate) fn frame_label(maps: &MemoryMaps, pc: usize) -> String {
    match maps.containing(pc) {
        Some(mapping) => {
            let offset = (pc - mapping.start) as u64 + mapping.offset;
            match mapping.basename() {
                Some(name) => format!("{}+{:#x}", name, offset),
                None => format!("{:#x}", pc),
            }
        }
        None => format!("{:#x}", pc),
    }
}

/// Innermost `frames` of a stack, labelled and joined.
pub(crate) fn stack_label(maps: &MemoryMaps, stack: &StackTrace, frames: usize) -> String {
    let mut labels: Vec<String> = stack
        .pcs()
        .iter()
        .take(frames)
        .map(|&pc| frame_label(maps, pc))
        .collect();
    if stack.depth() > frames {
        labels.push("...".to_string());
    }
    labels.join(" < ")
}

pub(crate) fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_and_counts() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(-2048), "-2.0K");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00M");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn labels_frames_by_mapping() {
        let maps = MemoryMaps::parse(
            "55d0c0a00000-55d0c0a20000 r-xp 00001000 08:01 1234 /usr/bin/app\n",
        );
        assert_eq!(frame_label(&maps, 0x55d0c0a00010), "app+0x1010");
        assert_eq!(frame_label(&maps, 0x10), "0x10");

        let stack = StackTrace::from_pcs(&[0x55d0c0a00010, 0x20, 0x30]);
        assert_eq!(stack_label(&maps, &stack, 2), "app+0x1010 < 0x20 < ...");
    }
}
