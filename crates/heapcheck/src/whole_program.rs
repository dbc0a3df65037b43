//! The process-exit leak check.
//!
//! A whole-program check is a [`LeakChecker`] named `_main_` that starts
//! before (or at the top of) `main` and is verified from an `atexit`
//! handler. How strict it is depends on the [`Strictness`] level, normally
//! taken from the `HEAPCHECK` environment variable:
//!
//! ```text
//! HEAPCHECK=normal ./my_program
//! ```
//!
//! The [`heap_checked!`](crate::heap_checked) macro wires up the allocator
//! and the before-main hook. Programs that cannot use it call
//! [`start_from_main`] first thing in `main` instead.

use crate::checker::{CheckOutcome, LeakChecker};
use crate::config::Config;
use crate::context::{CheckMode, HeapCheck};
use crate::error::{Error, exit_code};
use crate::profile::{Locked, RecordingGuard};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex, Once};
use tracing::{debug, error, info, warn};

/// Name of the whole-program checker; also the stem of its dump files.
pub const MAIN_CHECKER: &str = "_main_";

/// What the whole-program check treats as roots of the live heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveRoots {
    /// No reachability pass; only ignored objects themselves are exempt.
    None,
    /// Ignored objects and whatever they reach.
    IgnoredOnly,
    /// Globals, thread stacks, ignored objects, and everything they reach.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WholeProgramPolicy {
    /// Take the start snapshot before `main` rather than at `start_from_main`.
    pub start_before_main: bool,
    pub live_roots: LiveRoots,
    /// Require an unchanged heap at exit instead of no growth.
    pub same_heap: bool,
    /// Ask the renderer for a per-call-site diff at exit.
    pub full_diff: bool,
}

impl WholeProgramPolicy {
    pub const MINIMAL: Self = Self {
        start_before_main: false,
        live_roots: LiveRoots::None,
        same_heap: false,
        full_diff: false,
    };

    pub const NORMAL: Self = Self {
        start_before_main: true,
        live_roots: LiveRoots::All,
        same_heap: false,
        full_diff: false,
    };

    pub const STRICT: Self = Self {
        start_before_main: true,
        live_roots: LiveRoots::All,
        same_heap: true,
        full_diff: false,
    };

    pub const DRACONIAN: Self = Self {
        start_before_main: true,
        live_roots: LiveRoots::IgnoredOnly,
        same_heap: true,
        full_diff: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Minimal,
    Normal,
    Strict,
    Draconian,
    /// Use [`Config::whole_program`] as configured.
    AsIs,
    /// No whole-program check; local checkers still work.
    Local,
}

impl Strictness {
    /// The policy for this level, or `None` when there is no whole-program
    /// check. `as_is` is returned for [`Strictness::AsIs`].
    pub fn resolve(self, as_is: &WholeProgramPolicy) -> Option<WholeProgramPolicy> {
        match self {
            Strictness::Minimal => Some(WholeProgramPolicy::MINIMAL),
            Strictness::Normal => Some(WholeProgramPolicy::NORMAL),
            Strictness::Strict => Some(WholeProgramPolicy::STRICT),
            Strictness::Draconian => Some(WholeProgramPolicy::DRACONIAN),
            Strictness::AsIs => Some(*as_is),
            Strictness::Local => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strictness::Minimal => "minimal",
            Strictness::Normal => "normal",
            Strictness::Strict => "strict",
            Strictness::Draconian => "draconian",
            Strictness::AsIs => "as-is",
            Strictness::Local => "local",
        }
    }
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strictness {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Strictness::Minimal),
            "normal" => Ok(Strictness::Normal),
            "strict" => Ok(Strictness::Strict),
            "draconian" => Ok(Strictness::Draconian),
            "as-is" | "as_is" => Ok(Strictness::AsIs),
            "local" => Ok(Strictness::Local),
            _ => Err(Error::InvalidStrictness(s.to_string())),
        }
    }
}

#[derive(Default)]
struct MainState<'a> {
    policy: Option<WholeProgramPolicy>,
    checker: Option<LeakChecker<'a>>,
    /// Verified or cancelled; nothing may start again.
    finished: bool,
}

/// Drives one whole-program check on a context.
pub(crate) struct Driver<'a> {
    ctx: &'a HeapCheck,
    /// Route the process allocator into the context when enabling.
    install_hooks: bool,
    state: Mutex<MainState<'a>>,
}

impl<'a> Driver<'a> {
    pub(crate) fn new(ctx: &'a HeapCheck, install_hooks: bool) -> Self {
        Self {
            ctx,
            install_hooks,
            state: Mutex::new(MainState::default()),
        }
    }

    /// Enable the configured level, starting the check if that level starts
    /// before main. Returns whether a check is now running.
    pub(crate) fn before_main(&self) -> bool {
        match self.ctx.with_config(|c| c.level) {
            Some(level) => self.enable(level, true),
            None => false,
        }
    }

    /// Enable `requested`, unless the configuration names a level, which
    /// wins. Returns whether a check is now running.
    pub(crate) fn start_from_main(&self, requested: Strictness) -> bool {
        let level = self.ctx.with_config(|c| c.level).unwrap_or(requested);
        self.enable(level, false)
    }

    fn enable(&self, level: Strictness, before_main: bool) -> bool {
        let mut state = Locked::lock(&self.state);
        if state.finished {
            return false;
        }
        if state.checker.is_some() {
            return true;
        }

        if self.install_hooks && !self.ctx.install() {
            warn!("allocator hooks already feed another profile; heap checking stays off");
            return false;
        }
        if self.ctx.mode() < CheckMode::Local {
            self.ctx.set_mode(CheckMode::Local);
        }

        let Some(policy) = self.ctx.with_config(|c| level.resolve(&c.whole_program)) else {
            debug!(%level, "local heap checking only");
            return false;
        };
        if before_main && !policy.start_before_main {
            debug!(%level, "whole-program check deferred to start_from_main");
            return false;
        }

        self.ctx.set_mode(CheckMode::WholeProgram);
        state.policy = Some(policy);
        state.checker = Some(self.ctx.whole_program_checker(MAIN_CHECKER, policy));
        info!(%level, "whole-program heap check started");
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        Locked::lock(&self.state).checker.is_some()
    }

    /// Verify the check now. `None` if no check was running.
    pub(crate) fn finish(&self) -> Option<CheckOutcome> {
        let (mut checker, policy) = {
            let mut state = Locked::lock(&self.state);
            state.finished = true;
            let checker = state.checker.take()?;
            let policy = state.policy?;
            (checker, policy)
        };
        checker.do_check(policy.same_heap, policy.full_diff, true);
        checker.outcome().cloned()
    }

    /// Drop the check without verifying. Local checkers keep working.
    pub(crate) fn cancel(&self) {
        let checker = {
            let mut state = Locked::lock(&self.state);
            state.finished = true;
            state.checker.take()
        };
        if let Some(checker) = checker {
            checker.cancel();
            info!("whole-program heap check cancelled");
        }
        if self.ctx.mode() == CheckMode::WholeProgram {
            self.ctx.set_mode(CheckMode::Local);
        }
    }
}

static MAIN: LazyLock<Driver<'static>> = LazyLock::new(|| Driver::new(HeapCheck::global(), true));
static ENV_CONFIG: Once = Once::new();
static EXIT_CHECK: Once = Once::new();

fn load_env_config() {
    ENV_CONFIG.call_once(|| {
        let _guard = RecordingGuard::enter();
        match Config::from_env() {
            Ok(config) => HeapCheck::global().set_config(config),
            Err(e) => error!("ignoring heap checker environment: {}", e),
        }
    });
}

fn register_exit_check() {
    EXIT_CHECK.call_once(|| {
        // SAFETY: `after_main` is a plain extern "C" fn with no arguments.
        if unsafe { libc::atexit(after_main) } != 0 {
            warn!("cannot register the exit-time heap check");
        }
    });
}

/// Read the environment and, for levels that start before `main`, install
/// the allocator hooks and take the start snapshot. Run from `.init_array`
/// by [`heap_checked!`](crate::heap_checked).
pub fn before_main() {
    load_env_config();
    if MAIN.before_main() {
        register_exit_check();
    }
}

/// Complete whole-program setup at the top of `main`. A level named in
/// `HEAPCHECK` overrides `level`. Returns whether the exit-time check will
/// run.
pub fn start_from_main(level: Strictness) -> bool {
    load_env_config();
    let running = MAIN.start_from_main(level);
    if running {
        register_exit_check();
    }
    running
}

/// Whether a whole-program check is waiting for process exit.
pub fn is_running() -> bool {
    MAIN.is_running()
}

/// Run the whole-program check now instead of at exit. True when it passes
/// or when no check was running. Cleanups do not run.
pub fn no_global_leaks() -> bool {
    MAIN.finish().is_none_or(|outcome| outcome.passed)
}

/// Abandon the whole-program check.
pub fn cancel() {
    MAIN.cancel();
}

extern "C" fn after_main() {
    let ran = HeapCheck::global().cleanups().run();
    if ran > 0 {
        debug!(ran, "cleanups finished before the exit check");
    }
    match MAIN.finish() {
        Some(outcome) if !outcome.passed => {
            // The report was logged; without a subscriber nobody saw it.
            if !tracing::dispatcher::has_been_set() {
                let _ = writeln!(std::io::stderr(), "{}", exit_message(&outcome));
            }
            let _ = std::io::stdout().flush();
            // SAFETY: skipping the remaining exit handlers is the point; the
            // process is done.
            unsafe { libc::_exit(exit_code::LEAKS_FOUND) };
        }
        _ => {}
    }
}

/// What a failed exit check prints to stderr.
fn exit_message(outcome: &CheckOutcome) -> String {
    outcome.report.clone().unwrap_or_else(|| {
        format!(
            "heap checker '{}' failed: {:+} byte(s), {:+} object(s) since start",
            outcome.checker, outcome.bytes_delta, outcome.objects_delta
        )
    })
}
