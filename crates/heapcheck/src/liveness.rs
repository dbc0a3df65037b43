//! Conservative reachability over the live heap.
//!
//! [`LiveSet`] holds the address and size of every live allocation. Scanning
//! a region treats each aligned word as a possible pointer: if it equals the
//! start of a live allocation, that allocation is marked and queued, and
//! [`LiveSet::propagate`] later scans its contents the same way. The result
//! over-approximates liveness; an unrelated integer that happens to equal a
//! heap address keeps an object alive.
//!
//! All buffers are sized up front. After [`LiveSet::new`] returns, marking
//! and propagating never allocate, so they are safe to run while other
//! threads are stopped at arbitrary points (possibly inside the allocator).

use std::mem::size_of;

const WORD: usize = size_of::<usize>();

#[derive(Debug)]
pub struct LiveSet {
    addrs: Vec<usize>,
    sizes: Vec<usize>,
    marked: Vec<bool>,
    pending: Vec<usize>,
    marked_count: usize,
}

impl LiveSet {
    /// Build the set from `(address, size)` pairs.
    pub fn new(objects: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut objects: Vec<(usize, usize)> = objects.into_iter().collect();
        objects.sort_unstable_by_key(|&(addr, _)| addr);
        objects.dedup_by_key(|&mut (addr, _)| addr);

        let len = objects.len();
        let (addrs, sizes) = objects.into_iter().unzip();
        Self {
            addrs,
            sizes,
            marked: vec![false; len],
            pending: Vec::with_capacity(len),
            marked_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Mark the allocation starting at `addr`. Returns true if it was live
    /// and not yet marked.
    pub fn mark(&mut self, addr: usize) -> bool {
        let Ok(index) = self.addrs.binary_search(&addr) else {
            return false;
        };
        if self.marked[index] {
            return false;
        }
        self.marked[index] = true;
        self.marked_count += 1;
        // Each index is queued at most once, so this never grows past `len`.
        self.pending.push(index);
        true
    }

    /// Treat every word of `words` as a potential pointer.
    pub fn scan_words(&mut self, words: &[usize]) {
        for &word in words {
            self.mark(word);
        }
    }

    /// Scan every aligned word in `[start, end)`.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped and readable for the duration of the
    /// call. Its contents may change concurrently; reads are volatile and a
    /// torn value is just another candidate pointer.
    pub unsafe fn scan_region(&mut self, start: usize, end: usize) {
        let mut addr = start.next_multiple_of(WORD);
        while addr.saturating_add(WORD) <= end {
            // SAFETY: aligned and inside the readable range per the contract.
            let word = unsafe { std::ptr::read_volatile(addr as *const usize) };
            self.mark(word);
            addr += WORD;
        }
    }

    /// Scan the contents of every marked object until nothing new is found.
    ///
    /// Marked objects must still be allocated: the caller holds whatever
    /// lock keeps them from being freed.
    pub fn propagate(&mut self) {
        while let Some(index) = self.pending.pop() {
            let start = self.addrs[index];
            let end = start.saturating_add(self.sizes[index]);
            // SAFETY: `start..end` is a live heap allocation.
            unsafe { self.scan_region(start, end) };
        }
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        self.addrs
            .binary_search(&addr)
            .is_ok_and(|index| self.marked[index])
    }

    pub fn marked_count(&self) -> usize {
        self.marked_count
    }

    /// Addresses of objects nothing reached.
    pub fn unmarked(&self) -> impl Iterator<Item = usize> + '_ {
        self.addrs
            .iter()
            .zip(&self.marked)
            .filter(|&(_, &marked)| !marked)
            .map(|(&addr, _)| addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_of<T>(value: &T) -> usize {
        value as *const T as usize
    }

    #[test]
    fn words_mark_only_exact_starts() {
        let mut live = LiveSet::new([(0x1000, 16), (0x2000, 16)]);
        live.scan_words(&[0x1008, 0x2000, 7]);
        assert!(!live.is_marked(0x1000));
        assert!(live.is_marked(0x2000));
        assert_eq!(live.marked_count(), 1);
        assert_eq!(live.unmarked().collect::<Vec<_>>(), vec![0x1000]);
    }

    #[test]
    fn marking_twice_queues_once() {
        let mut live = LiveSet::new([(0x1000, 16)]);
        assert!(live.mark(0x1000));
        assert!(!live.mark(0x1000));
        assert!(!live.mark(0x9999));
    }

    #[test]
    fn propagates_through_chains() {
        // tail <- middle <- head, plus an unreachable island.
        let tail = Box::new([0usize; 2]);
        let middle = Box::new([addr_of(&*tail), 0]);
        let head = Box::new([0, addr_of(&*middle)]);
        let island = Box::new([addr_of(&*tail), 0]);

        let mut live = LiveSet::new(
            [&tail, &middle, &head, &island].map(|b| (addr_of(&**b), 2 * WORD)),
        );
        let roots = [addr_of(&*head)];
        live.scan_words(&roots);
        live.propagate();

        assert!(live.is_marked(addr_of(&*head)));
        assert!(live.is_marked(addr_of(&*middle)));
        assert!(live.is_marked(addr_of(&*tail)));
        assert!(!live.is_marked(addr_of(&*island)));
    }

    #[test]
    fn cycles_terminate() {
        let mut a = Box::new([0usize; 1]);
        let b = Box::new([addr_of(&*a)]);
        a[0] = addr_of(&*b);

        let mut live = LiveSet::new([(addr_of(&*a), WORD), (addr_of(&*b), WORD)]);
        live.mark(addr_of(&*a));
        live.propagate();
        assert_eq!(live.marked_count(), 2);
    }

    #[test]
    fn scan_region_reads_unaligned_bounds() {
        let target = Box::new(0u64);
        let holder = [0usize, addr_of(&*target), 0];

        let mut live = LiveSet::new([(addr_of(&*target), 8)]);
        let start = addr_of(&holder) + 1;
        let end = addr_of(&holder) + 3 * WORD - 1;
        unsafe { live.scan_region(start, end) };
        assert!(live.is_marked(addr_of(&*target)));
    }
}
