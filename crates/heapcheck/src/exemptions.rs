//! Exemption registries: allocations the checker must not call leaks.
//!
//! Three kinds of entry live here. Disabled address ranges exempt any
//! allocation whose recent call stack passes through them; ignored objects
//! are live allocations treated as roots; library regions exempt whatever
//! system libraries allocate for themselves. Source patterns are kept for
//! renderers, which match them against symbolized stacks.

use crate::error::{Error, Result};
use crate::process::MemoryMaps;
use crate::stack::{MAX_STACK_DEPTH, StackTrace};
use regex::Regex;
use std::collections::BTreeSet;

/// Frames examined when matching a stack against a library region.
pub const LIBRARY_MATCH_DEPTH: usize = 4;

/// A code address range that exempts allocations made from within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisabledRange {
    pub start: usize,
    pub end: usize,
    /// Only the innermost `max_depth` frames are compared.
    pub max_depth: usize,
}

impl DisabledRange {
    pub fn matches(&self, stack: &StackTrace) -> bool {
        stack.intersects(self.start, self.end, self.max_depth)
    }
}

/// Code of a system library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRegion {
    pub library: String,
    pub start: usize,
    pub end: usize,
}

impl LibraryRegion {
    pub fn matches(&self, stack: &StackTrace) -> bool {
        stack.intersects(self.start, self.end, LIBRARY_MATCH_DEPTH)
    }
}

#[derive(Debug, Default)]
pub struct Exemptions {
    ranges: Vec<DisabledRange>,
    ignored: BTreeSet<usize>,
    libraries: Vec<LibraryRegion>,
    patterns: Vec<Regex>,
}

impl Exemptions {
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            ignored: BTreeSet::new(),
            libraries: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn disable_range(&mut self, start: usize, end: usize, max_depth: usize) -> Result<()> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        self.ranges.push(DisabledRange {
            start,
            end,
            max_depth: max_depth.clamp(1, MAX_STACK_DEPTH),
        });
        Ok(())
    }

    /// Remove a range registered with exactly these arguments. Returns false
    /// if there was none.
    pub fn enable_range(&mut self, start: usize, end: usize, max_depth: usize) -> bool {
        let wanted = DisabledRange {
            start,
            end,
            max_depth: max_depth.clamp(1, MAX_STACK_DEPTH),
        };
        match self.ranges.iter().position(|r| *r == wanted) {
            Some(index) => {
                self.ranges.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn ranges(&self) -> &[DisabledRange] {
        &self.ranges
    }

    pub fn ignore(&mut self, addr: usize) -> Result<()> {
        if self.ignored.insert(addr) {
            Ok(())
        } else {
            Err(Error::AlreadyIgnored(addr))
        }
    }

    pub fn unignore(&mut self, addr: usize) -> Result<()> {
        if self.ignored.remove(&addr) {
            Ok(())
        } else {
            Err(Error::NotIgnored(addr))
        }
    }

    /// Drop an entry without complaint, for objects freed while ignored.
    pub fn forget_ignored(&mut self, addr: usize) -> bool {
        self.ignored.remove(&addr)
    }

    pub fn is_ignored(&self, addr: usize) -> bool {
        self.ignored.contains(&addr)
    }

    pub fn ignored(&self) -> impl Iterator<Item = usize> + '_ {
        self.ignored.iter().copied()
    }

    pub fn set_libraries(&mut self, libraries: Vec<LibraryRegion>) {
        self.libraries = libraries;
    }

    pub fn libraries(&self) -> &[LibraryRegion] {
        &self.libraries
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern)?;
        if !self.patterns.iter().any(|p| p.as_str() == regex.as_str()) {
            self.patterns.push(regex);
        }
        Ok(())
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    /// Whether an allocation made from `stack` passes through a disabled range.
    pub fn is_disabled(&self, stack: &StackTrace) -> bool {
        self.ranges.iter().any(|r| r.matches(stack))
    }

    /// Whether an allocation made from `stack` came out of a system library.
    pub fn in_system_library(&self, stack: &StackTrace) -> bool {
        self.libraries.iter().any(|l| l.matches(stack))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
            && self.ignored.is_empty()
            && self.libraries.is_empty()
            && self.patterns.is_empty()
    }
}

/// Executable regions of every mapped library whose file name starts with
/// one of `prefixes`.
pub fn library_regions(maps: &MemoryMaps, prefixes: &[String]) -> Vec<LibraryRegion> {
    maps.executable_mappings()
        .filter_map(|m| {
            let name = m.basename()?;
            prefixes
                .iter()
                .any(|p| name.starts_with(p.as_str()))
                .then(|| LibraryRegion {
                    library: name.to_string(),
                    start: m.start,
                    end: m.end,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_round_trip() {
        let mut ex = Exemptions::new();
        ex.disable_range(0x1000, 0x2000, 5).unwrap();
        let inside = StackTrace::from_pcs(&[0x10, 0x1800]);
        assert!(ex.is_disabled(&inside));

        assert!(!ex.enable_range(0x1000, 0x2000, 4));
        assert!(ex.enable_range(0x1000, 0x2000, 5));
        assert!(!ex.is_disabled(&inside));
        assert!(ex.is_empty());
    }

    #[test]
    fn range_respects_depth() {
        let mut ex = Exemptions::new();
        ex.disable_range(0x1000, 0x2000, 1).unwrap();
        assert!(!ex.is_disabled(&StackTrace::from_pcs(&[0x10, 0x1800])));
        assert!(ex.is_disabled(&StackTrace::from_pcs(&[0x1800, 0x10])));
    }

    #[test]
    fn empty_range_is_rejected() {
        let mut ex = Exemptions::new();
        let err = ex.disable_range(0x2000, 0x2000, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
    }

    #[test]
    fn ignore_twice_or_unignore_unknown_fails() {
        let mut ex = Exemptions::new();
        ex.ignore(0x40).unwrap();
        assert!(matches!(ex.ignore(0x40), Err(Error::AlreadyIgnored(0x40))));
        ex.unignore(0x40).unwrap();
        assert!(matches!(ex.unignore(0x40), Err(Error::NotIgnored(0x40))));
    }

    #[test]
    fn library_regions_match_prefixes_and_shallow_frames() {
        let maps = MemoryMaps::parse(
            "\
7f0000000000-7f0000100000 r-xp 00000000 08:01 1 /usr/lib/libc.so.6
7f0000100000-7f0000200000 rw-p 00100000 08:01 1 /usr/lib/libc.so.6
7f1000000000-7f1000100000 r-xp 00000000 08:01 2 /usr/lib/libssl.so.3
",
        );
        let regions = library_regions(&maps, &["libc.so".to_string()]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].library, "libc.so.6");

        let mut ex = Exemptions::new();
        ex.set_libraries(regions);
        let shallow = StackTrace::from_pcs(&[1, 2, 3, 0x7f0000000100]);
        assert!(ex.in_system_library(&shallow));
        assert!(!ex.is_disabled(&shallow));
        assert!(!ex.in_system_library(&StackTrace::from_pcs(&[1, 2, 3, 4, 0x7f0000000100])));
    }

    #[test]
    fn patterns_are_validated_and_deduplicated() {
        let mut ex = Exemptions::new();
        ex.add_pattern("^my_crate::cache").unwrap();
        ex.add_pattern("^my_crate::cache").unwrap();
        assert_eq!(ex.patterns().len(), 1);
        assert!(matches!(ex.add_pattern("("), Err(Error::InvalidPattern(_))));
    }
}
