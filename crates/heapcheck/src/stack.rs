//! Call-stack fingerprints.
//!
//! A fingerprint is the ordered list of program counters of a call stack,
//! innermost first, bounded to [`MAX_STACK_DEPTH`]. Capturing one is the only
//! platform-specific step; everything downstream only compares addresses.

use std::ffi::c_void;
use std::fmt;

/// Maximum number of frames kept per fingerprint.
pub const MAX_STACK_DEPTH: usize = 32;

/// A bounded call-stack fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackTrace {
    depth: usize,
    pcs: [usize; MAX_STACK_DEPTH],
}

impl StackTrace {
    pub const fn empty() -> Self {
        Self {
            depth: 0,
            pcs: [0; MAX_STACK_DEPTH],
        }
    }

    /// Build a fingerprint from explicit program counters, innermost first.
    /// Anything past [`MAX_STACK_DEPTH`] is dropped.
    pub fn from_pcs(pcs: &[usize]) -> Self {
        let mut trace = Self::empty();
        for &pc in pcs.iter().take(MAX_STACK_DEPTH) {
            trace.pcs[trace.depth] = pc;
            trace.depth += 1;
        }
        trace
    }

    /// Capture the current call stack, starting at the caller of this function.
    #[inline(never)]
    pub fn capture() -> Self {
        Self::capture_after(Self::capture as fn() -> Self as usize, MAX_STACK_DEPTH)
    }

    /// Capture the current call stack, skipping every frame up to and
    /// including the one belonging to the function at `marker`.
    ///
    /// If no frame matches `marker` (for example because it was inlined)
    /// the whole stack is kept.
    pub fn capture_after(marker: usize, max_depth: usize) -> Self {
        Self::capture_after_skipping(marker, max_depth, |_, _| false)
    }

    /// Like [`StackTrace::capture_after`], but also drops the frames right
    /// after `marker` for which `skip(symbol_address, ip)` holds. Skipped
    /// frames do not count towards `max_depth`.
    pub fn capture_after_skipping(
        marker: usize,
        max_depth: usize,
        mut skip: impl FnMut(usize, usize) -> bool,
    ) -> Self {
        let max_depth = max_depth.clamp(1, MAX_STACK_DEPTH);
        let mut trace = Self::empty();
        let mut found = false;
        let mut skipping = true;

        // SAFETY: the unwinder on our supported targets is thread-safe; the
        // unsynchronized variant just avoids the crate's global lock, which
        // must not be taken from inside an allocation hook.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let symbol = frame.symbol_address() as usize;
                let ip = frame.ip() as usize;
                if !found && symbol == marker {
                    found = true;
                    trace.depth = 0;
                    return true;
                }
                if found && skipping {
                    if skip(symbol, ip) {
                        return true;
                    }
                    skipping = false;
                }
                trace.pcs[trace.depth] = ip;
                trace.depth += 1;
                if found {
                    trace.depth < max_depth
                } else {
                    trace.depth < MAX_STACK_DEPTH
                }
            });
        }

        trace.depth = trace.depth.min(max_depth);
        // Fingerprints compare whole arrays; frames dropped above must not linger.
        trace.pcs[trace.depth..].fill(0);
        trace
    }

    pub fn pcs(&self) -> &[usize] {
        &self.pcs[..self.depth]
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    /// The innermost `max_depth` frames.
    pub fn innermost(&self, max_depth: usize) -> &[usize] {
        &self.pcs[..self.depth.min(max_depth)]
    }

    /// Whether any of the innermost `max_depth` frames lies in `[start, end)`.
    pub fn intersects(&self, start: usize, end: usize, max_depth: usize) -> bool {
        self.innermost(max_depth)
            .iter()
            .any(|&pc| start <= pc && pc < end)
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.pcs().iter().map(|pc| format!("{pc:#x}")))
            .finish()
    }
}

/// The return address into the caller of the function at `marker`.
///
/// `marker` must be the address of a non-inlined function that is currently
/// on the stack; the result is the program counter of the frame right below
/// it, i.e. the point in its caller the call will return to.
pub fn caller_return_address(marker: usize) -> Option<usize> {
    let mut found = false;
    let mut result = None;

    // SAFETY: see `StackTrace::capture_after`.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if found {
                result = Some(frame.ip() as usize);
                return false;
            }
            found = frame.symbol_address() as usize == marker;
            true
        });
    }

    result
}

/// The name of the function that physically contains `pc`, demangled.
///
/// Inlined callees at `pc` are reported first by the symbolizer; the last
/// name is the enclosing function.
pub fn enclosing_function_name(pc: usize) -> Option<String> {
    let mut name = None;
    backtrace::resolve(pc as *mut c_void, |symbol| {
        if let Some(n) = symbol.name() {
            name = Some(n.to_string());
        }
    });
    name
}

/// The first symbol name for `pc`, demangled.
pub fn symbol_name(pc: usize) -> Option<String> {
    let mut name = None;
    backtrace::resolve(pc as *mut c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pcs_truncates_to_max_depth() {
        let pcs: Vec<usize> = (1..=40).collect();
        let trace = StackTrace::from_pcs(&pcs);
        assert_eq!(trace.depth(), MAX_STACK_DEPTH);
        assert_eq!(trace.pcs()[0], 1);
        assert_eq!(trace.innermost(3), &[1, 2, 3]);
    }

    #[test]
    fn intersects_only_looks_at_innermost_frames() {
        let trace = StackTrace::from_pcs(&[0x100, 0x200, 0x300]);
        assert!(trace.intersects(0x200, 0x201, 2));
        assert!(!trace.intersects(0x300, 0x400, 2));
        assert!(trace.intersects(0x300, 0x400, MAX_STACK_DEPTH));
        assert!(!trace.intersects(0x101, 0x200, MAX_STACK_DEPTH));
    }

    #[test]
    fn equal_pcs_give_equal_fingerprints() {
        let a = StackTrace::from_pcs(&[0x10, 0x20]);
        let b = StackTrace::from_pcs(&[0x10, 0x20]);
        let c = StackTrace::from_pcs(&[0x10, 0x21]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn capture_sees_some_frames() {
        let trace = StackTrace::capture();
        assert!(!trace.is_empty());
    }

    #[inline(never)]
    fn skipped_frames_do_not_count() -> StackTrace {
        let mut skipped = 0;
        StackTrace::capture_after_skipping(
            skipped_frames_do_not_count as fn() -> StackTrace as usize,
            2,
            |_, _| {
                skipped += 1;
                skipped <= 1
            },
        )
    }

    #[test]
    fn skipping_drops_leading_frames_only() {
        let trace = skipped_frames_do_not_count();
        assert_eq!(trace.depth(), 2);
    }

    #[inline(never)]
    fn returns_into_caller() -> Option<usize> {
        caller_return_address(returns_into_caller as fn() -> Option<usize> as usize)
    }

    #[test]
    fn caller_return_address_is_inside_caller() {
        let pc = returns_into_caller().expect("no caller frame");
        assert_ne!(pc, 0);
    }
}
