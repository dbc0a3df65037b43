//! The process-scoped checker state.
//!
//! [`HeapCheck`] owns everything a check consults: configuration, the heap
//! profile, the exemption registries, the stats registry and the cleanup
//! list. The process has one, reached through [`HeapCheck::global`]; tests
//! build private ones with [`HeapCheck::new`] and feed them by hand.
//!
//! Lock order is profile table first, exemptions second.

use crate::analysis::{self, Analysis, Scope};
use crate::bridge;
use crate::checker::LeakChecker;
use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exemptions::{self, Exemptions};
use crate::process::MemoryMaps;
use crate::profile::{HeapProfile, Locked, ProfileTable, RecordingGuard};
use crate::render::{self, ProfileRenderer};
use crate::roots::{ExplicitRoots, ProcessRoots, RootSource};
use crate::stack::{MAX_STACK_DEPTH, StackTrace, caller_return_address};
use crate::stats::{ProfileStats, StatsRegistry};
use crate::whole_program::WholeProgramPolicy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use tracing::{debug, error, warn};

/// How far checking is switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CheckMode {
    /// Nothing is recorded; registry calls are accepted and ignored.
    Off = 0,
    /// Local checkers work; no whole-program check.
    Local = 1,
    WholeProgram = 2,
}

impl CheckMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CheckMode::Local,
            2 => CheckMode::WholeProgram,
            _ => CheckMode::Off,
        }
    }
}

pub struct HeapCheck {
    config: RwLock<Config>,
    profile: Arc<HeapProfile>,
    exemptions: Mutex<Exemptions>,
    stats: StatsRegistry,
    cleanups: CleanupRegistry,
    mode: AtomicU8,
    roots: Box<dyn RootSource>,
    renderer: RwLock<Option<Arc<dyn ProfileRenderer>>>,
}

static GLOBAL: LazyLock<HeapCheck> = LazyLock::new(|| {
    let _guard = RecordingGuard::enter();
    HeapCheck::with_roots(Config::default(), Box::new(ProcessRoots), CheckMode::Off)
});

impl HeapCheck {
    /// The process-wide checker. Starts switched off until [`HeapCheck::install`]
    /// or the whole-program driver turns it on.
    pub fn global() -> &'static HeapCheck {
        &GLOBAL
    }

    /// A private checker in local mode whose profile records only what the
    /// caller feeds it through [`HeapProfile::record_alloc`].
    pub fn new(config: Config) -> Self {
        let ctx = Self::with_roots(config, Box::new(ExplicitRoots::none()), CheckMode::Local);
        ctx.profile.set_recording(true);
        ctx
    }

    /// A checker with a custom root source, starting in `mode`.
    pub fn with_roots(config: Config, roots: Box<dyn RootSource>, mode: CheckMode) -> Self {
        Self {
            config: RwLock::new(config),
            profile: Arc::new(HeapProfile::new()),
            exemptions: Mutex::new(Exemptions::new()),
            stats: StatsRegistry::new(),
            cleanups: CleanupRegistry::new(),
            mode: AtomicU8::new(mode as u8),
            roots,
            renderer: RwLock::new(None),
        }
    }

    /// Route the process allocator hooks into this checker's profile and
    /// switch on at least local checking. Returns false if another profile
    /// already receives the hooks.
    pub fn install(&self) -> bool {
        if !bridge::install(&self.profile) {
            return false;
        }
        {
            let _guard = RecordingGuard::enter();
            self.stats
                .register(Box::new(ProfileStats::new(Arc::clone(&self.profile))));
        }
        if self.mode() < CheckMode::Local {
            self.set_mode(CheckMode::Local);
        }
        debug!("heap profile recording");
        true
    }

    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Read the configuration in place, without cloning it.
    pub fn with_config<R>(&self, read: impl FnOnce(&Config) -> R) -> R {
        read(
            &self
                .config
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Replace the configuration. Running checkers keep the dump directory
    /// and renderer they started with.
    pub fn set_config(&self, config: Config) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn update_config(&self, update: impl FnOnce(&mut Config)) {
        update(
            &mut self
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    pub fn profile(&self) -> &Arc<HeapProfile> {
        &self.profile
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn cleanups(&self) -> &CleanupRegistry {
        &self.cleanups
    }

    pub fn mode(&self) -> CheckMode {
        CheckMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: CheckMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.mode() != CheckMode::Off
    }

    /// Use `renderer` for full checks instead of the configured one.
    pub fn set_renderer(&self, renderer: Arc<dyn ProfileRenderer>) {
        *self
            .renderer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(renderer);
    }

    pub fn renderer(&self) -> Arc<dyn ProfileRenderer> {
        if let Some(renderer) = self
            .renderer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            return Arc::clone(renderer);
        }
        let _guard = RecordingGuard::enter();
        Arc::from(self.with_config(|c| render::select(c.pprof_path.as_deref())))
    }

    /// Start a local checker named `name`.
    pub fn checker(&self, name: &str) -> LeakChecker<'_> {
        LeakChecker::start(self, name, Scope::Local)
    }

    /// Start a whole-program checker running under `policy`.
    pub fn whole_program_checker(&self, name: &str, policy: WholeProgramPolicy) -> LeakChecker<'_> {
        LeakChecker::start(self, name, Scope::WholeProgram(policy.live_roots))
    }

    pub(crate) fn exemptions(&self) -> Locked<'_, Exemptions> {
        Locked::lock(&self.exemptions)
    }

    /// Run an exemption pass with the table already locked.
    pub(crate) fn analyze(&self, table: &mut ProfileTable, scope: Scope) -> (Analysis, Vec<usize>) {
        let freed = table.take_ignored_freed();
        let mut exemptions = self.exemptions();
        for &addr in &freed {
            exemptions.forget_ignored(addr);
        }
        let timeout = self.with_config(|c| c.suspend_timeout);
        let analysis = analysis::analyze(table, &exemptions, scope, self.roots.as_ref(), timeout);
        (analysis, freed)
    }

    /// Refresh system library regions from the current memory map.
    pub(crate) fn refresh_libraries(&self) {
        let regions = {
            let _guard = RecordingGuard::enter();
            MemoryMaps::for_self().map(|maps| {
                self.with_config(|c| exemptions::library_regions(&maps, &c.system_libraries))
            })
        };
        match regions {
            Ok(regions) => self.exemptions().set_libraries(regions),
            Err(e) => warn!("cannot locate system libraries: {}", e),
        }
    }

    /// Log a usage error; panic on it when configured to.
    pub(crate) fn report_usage(&self, err: &Error) {
        if self.with_config(|c| c.strict_usage) && !std::thread::panicking() {
            panic!("heap checker misuse: {}", err);
        }
        error!("heap checker misuse: {}", err);
    }

    fn usage<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.report_usage(e);
        }
        result
    }

    // ----- exemption registries -----

    /// Exempt allocations whose innermost `max_depth` frames pass through
    /// `[start, end)`.
    pub fn disable_range(&self, start: usize, end: usize, max_depth: usize) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.exemptions().disable_range(start, end, max_depth);
        self.usage(result)
    }

    /// Undo a [`HeapCheck::disable_range`] with the same arguments.
    pub fn enable_range(&self, start: usize, end: usize, max_depth: usize) -> bool {
        self.exemptions().enable_range(start, end, max_depth)
    }

    /// Exempt everything allocated inside the call that returns to `addr`.
    pub fn disable_call_site(&self, addr: usize) -> Result<()> {
        self.disable_range(addr, addr.saturating_add(1), MAX_STACK_DEPTH)
    }

    /// Exempt every call made between two markers taken in the same frame.
    pub fn disable_call_sites_between(&self, start_marker: usize, end_marker: usize) -> Result<()> {
        let (start, end) = if start_marker <= end_marker {
            (start_marker, end_marker)
        } else {
            (end_marker, start_marker)
        };
        if start == end {
            return self.usage(Err(Error::InvalidRange { start, end }));
        }
        self.disable_range(start, end, MAX_STACK_DEPTH)
    }

    /// A marker for [`HeapCheck::disable_checks_to_here_from`]: the return
    /// address into the calling function.
    #[inline(never)]
    pub fn disable_checks_start(&self) -> usize {
        caller_return_address(Self::disable_checks_start as fn(&Self) -> usize as usize)
            .unwrap_or(0)
    }

    /// Exempt every call the caller made since taking `start` with
    /// [`HeapCheck::disable_checks_start`].
    #[inline(never)]
    pub fn disable_checks_to_here_from(&self, start: usize) -> Result<()> {
        let here = caller_return_address(
            Self::disable_checks_to_here_from as fn(&Self, usize) -> Result<()> as usize,
        );
        match (start, here) {
            (0, _) | (_, None) => self.usage(Err(Error::NoCallerFrame)),
            (start, Some(end)) => self.disable_call_sites_between(start, end),
        }
    }

    /// Exempt whatever is allocated inside the call `levels` frames above
    /// the caller. `0` is the caller's own call site.
    #[inline(never)]
    pub fn disable_checks_up(&self, levels: usize) -> Result<()> {
        let stack = StackTrace::capture_after(
            Self::disable_checks_up as fn(&Self, usize) -> Result<()> as usize,
            MAX_STACK_DEPTH,
        );
        match stack.pcs().get(levels) {
            Some(&pc) => self.disable_call_site(pc),
            None => self.usage(Err(Error::NoCallerFrame)),
        }
    }

    /// Skip renderer buckets whose stack has a symbol matching `pattern`.
    pub fn disable_checks_in(&self, pattern: &str) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.exemptions().add_pattern(pattern);
        self.usage(result)
    }

    /// Treat the live object at `ptr`, and everything it reaches, as alive in
    /// whole-program checks.
    pub fn ignore_object<T: ?Sized>(&self, ptr: *const T) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let addr = ptr as *const u8 as usize;
        let result = {
            let mut table = self.profile.lock();
            if table.is_live(addr) {
                self.exemptions().ignore(addr).map(|()| {
                    table.set_ignored(addr, true);
                })
            } else {
                Err(Error::NotLive(addr))
            }
        };
        if result.is_ok() {
            debug!("ignoring object {:#x}", addr);
        }
        self.usage(result)
    }

    /// Undo [`HeapCheck::ignore_object`].
    pub fn unignore_object<T: ?Sized>(&self, ptr: *const T) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let addr = ptr as *const u8 as usize;
        let result = {
            let mut table = self.profile.lock();
            if table.is_live(addr) {
                self.exemptions().unignore(addr).map(|()| {
                    table.set_ignored(addr, false);
                })
            } else {
                Err(Error::NotLive(addr))
            }
        };
        self.usage(result)
    }

    pub fn is_ignored<T: ?Sized>(&self, ptr: *const T) -> bool {
        self.exemptions().is_ignored(ptr as *const u8 as usize)
    }

    /// Register work to run just before the final whole-program check.
    pub fn register_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        let _guard = RecordingGuard::enter();
        self.cleanups.register(cleanup);
    }
}

impl std::fmt::Debug for HeapCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapCheck")
            .field("mode", &self.mode())
            .field("recording", &self.profile.is_recording())
            .finish_non_exhaustive()
    }
}
