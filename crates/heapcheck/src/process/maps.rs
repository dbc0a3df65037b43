use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// A parsed memory mapping from /proc/[pid]/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn is_writable(&self) -> bool {
        self.perms.as_bytes().get(1) == Some(&b'w')
    }

    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn is_private(&self) -> bool {
        self.perms.ends_with('p')
    }

    /// Backed by a file on disk (as opposed to anonymous or `[heap]`-style pseudo mappings).
    pub fn is_file_backed(&self) -> bool {
        self.pathname.as_deref().is_some_and(|p| p.starts_with('/'))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// File name of the mapped object, without directories.
    pub fn basename(&self) -> Option<&str> {
        let path = self.pathname.as_deref()?;
        Path::new(path).file_name().and_then(|n| n.to_str())
    }
}

/// Collection of memory mappings for a process
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
    raw: String,
}

impl MemoryMaps {
    /// Parse /proc/self/maps
    pub fn for_self() -> Result<Self> {
        Self::read("/proc/self/maps")
    }

    /// Parse /proc/[pid]/maps
    pub fn for_pid(pid: u32) -> Result<Self> {
        Self::read(&format!("/proc/{}/maps", pid))
    }

    fn read(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::MapsUnavailable(format!("cannot read {}: {}", path, e)))?;
        Ok(Self::parse(&content))
    }

    /// Parse the text of a maps file. Lines that do not parse are skipped.
    pub fn parse(content: &str) -> Self {
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        MemoryMaps {
            mappings,
            raw: content.to_string(),
        }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        // Parse address range "start-end"
        let (start, end) = parts[0].split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        // Pathname is the last field (if present)
        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    /// The maps text as read, for embedding in heap dumps.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The mapping containing `addr`, if any. Does not allocate.
    pub fn containing(&self, addr: usize) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(addr))
    }

    /// Get all executable mappings
    pub fn executable_mappings(&self) -> impl Iterator<Item = &MemoryMapping> {
        self.mappings.iter().filter(|m| m.is_executable())
    }
}
