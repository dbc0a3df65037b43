//! Stopping the other threads of the process while their stacks are scanned.
//!
//! Each thread listed in `/proc/self/task` is sent a real-time signal. The
//! handler records its own stack pointer and spins until released. Because
//! the kernel pushes the interrupted register file onto the same stack before
//! running the handler, scanning from that stack pointer to the top of the
//! thread's stack mapping covers both the stack and the saved registers.
//!
//! While threads are parked they may hold arbitrary locks (the allocator's
//! included), so the holder of a [`SuspendedThreads`] must not allocate,
//! log, or unwind until it is dropped.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};

/// Upper bound on threads whose stacks are recorded.
pub const MAX_THREADS: usize = 1024;

static PARKED_SP: [AtomicUsize; MAX_THREADS] = [const { AtomicUsize::new(0) }; MAX_THREADS];
static ARRIVED: AtomicUsize = AtomicUsize::new(0);
static DEPARTED: AtomicUsize = AtomicUsize::new(0);
static RELEASE: AtomicBool = AtomicBool::new(true);
static SUSPEND_LOCK: Mutex<()> = Mutex::new(());
static HANDLER: Once = Once::new();
static HANDLER_OK: AtomicBool = AtomicBool::new(false);

fn suspend_signal() -> libc::c_int {
    libc::SIGRTMIN() + 4
}

extern "C" fn park_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let marker = 0usize;
    let sp = std::hint::black_box(&marker) as *const usize as usize;

    let slot = ARRIVED.fetch_add(1, Ordering::AcqRel);
    if slot < MAX_THREADS {
        PARKED_SP[slot].store(sp, Ordering::Release);
    }

    while !RELEASE.load(Ordering::Acquire) {
        // SAFETY: async-signal-safe.
        unsafe { libc::sched_yield() };
    }
    DEPARTED.fetch_add(1, Ordering::AcqRel);
}

fn install_handler() -> bool {
    HANDLER.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = park_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        let ok = libc::sigaction(suspend_signal(), &sa, std::ptr::null_mut()) == 0;
        HANDLER_OK.store(ok, Ordering::Release);
    });
    HANDLER_OK.load(Ordering::Acquire)
}

/// Kernel thread id of the calling thread.
pub fn current_tid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Thread ids of every thread in this process except the caller.
pub fn other_threads() -> Result<Vec<libc::pid_t>> {
    let me = current_tid();
    let entries = std::fs::read_dir("/proc/self/task")
        .map_err(|e| Error::MapsUnavailable(format!("cannot list /proc/self/task: {}", e)))?;
    Ok(entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .filter(|&tid| tid != me)
        .collect())
}

/// Other threads, parked. Dropping this releases them.
#[derive(Debug)]
pub struct SuspendedThreads {
    signalled: usize,
    parked: usize,
    _lock: MutexGuard<'static, ()>,
}

impl SuspendedThreads {
    /// Stop every thread in `tids`, waiting at most `timeout` for them to
    /// park. Threads that exit or fail to answer in time are left running
    /// and counted in [`SuspendedThreads::missed`].
    pub fn stop(tids: &[libc::pid_t], timeout: Duration) -> Result<Self> {
        let lock = SUSPEND_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !install_handler() {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        ARRIVED.store(0, Ordering::Release);
        DEPARTED.store(0, Ordering::Release);
        RELEASE.store(false, Ordering::Release);

        let pid = std::process::id() as libc::pid_t;
        let mut signalled = 0;
        for &tid in tids {
            // SAFETY: tgkill only delivers a signal; a stale tid yields ESRCH.
            let rc = unsafe {
                libc::syscall(libc::SYS_tgkill, pid, tid, suspend_signal())
            };
            if rc == 0 {
                signalled += 1;
            }
        }

        let deadline = Instant::now() + timeout;
        while ARRIVED.load(Ordering::Acquire) < signalled && Instant::now() < deadline {
            // SAFETY: no preconditions.
            unsafe { libc::sched_yield() };
        }

        let parked = ARRIVED.load(Ordering::Acquire).min(signalled);
        Ok(SuspendedThreads {
            signalled,
            parked,
            _lock: lock,
        })
    }

    /// Stack pointers of the parked threads.
    pub fn stack_pointers(&self) -> impl Iterator<Item = usize> + '_ {
        PARKED_SP[..self.parked.min(MAX_THREADS)]
            .iter()
            .map(|sp| sp.load(Ordering::Acquire))
            .filter(|&sp| sp != 0)
    }

    pub fn parked(&self) -> usize {
        self.parked
    }

    /// Threads that were signalled but whose stacks are not available.
    pub fn missed(&self) -> usize {
        self.signalled - self.parked.min(MAX_THREADS)
    }
}

impl Drop for SuspendedThreads {
    fn drop(&mut self) {
        RELEASE.store(true, Ordering::Release);
        // Late arrivals see RELEASE already set and leave at once; wait only
        // for those we know are spinning.
        let deadline = Instant::now() + Duration::from_secs(1);
        while DEPARTED.load(Ordering::Acquire) < self.parked && Instant::now() < deadline {
            // SAFETY: no preconditions.
            unsafe { libc::sched_yield() };
        }
        for sp in &PARKED_SP[..self.parked.min(MAX_THREADS)] {
            sp.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn parks_and_releases_a_worker() {
        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = {
            let stop = Arc::clone(&stop);
            let ticks = Arc::clone(&ticks);
            std::thread::spawn(move || {
                tx.send(current_tid()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
            })
        };
        let tid = rx.recv().unwrap();

        {
            let threads = SuspendedThreads::stop(&[tid], Duration::from_secs(5)).unwrap();
            assert_eq!(threads.parked(), 1);
            assert_eq!(threads.missed(), 0);
            assert_eq!(threads.stack_pointers().count(), 1);

            let before = ticks.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(ticks.load(Ordering::Relaxed), before);
        }

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }

    #[test]
    fn own_thread_is_not_listed() {
        let others = other_threads().unwrap();
        assert!(!others.contains(&current_tid()));
    }
}
