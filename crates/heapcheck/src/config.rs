//! Static configuration for the checker.
//!
//! Values are read once, either from [`Config::default`] plus setters or from
//! the environment via [`Config::from_env`]. Changes made after whole-program
//! checking has started only affect local checkers.

use crate::error::{Error, Result};
use crate::whole_program::{Strictness, WholeProgramPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Library basename prefixes whose allocations are exempt from whole-program
/// checks by default.
pub const DEFAULT_SYSTEM_LIBRARIES: &[&str] =
    &["libc.so", "libc-", "ld-linux", "libpthread", "libdl"];

/// How long to wait for other threads to park before scanning without them.
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Config {
    /// Log a leak report when a check fails.
    pub report: bool,
    /// External profile renderer used for full checks.
    pub pprof_path: Option<PathBuf>,
    /// Where begin/end heap dumps are written.
    pub dump_directory: PathBuf,
    /// Write dump files at all. Full checks need them.
    pub dump_profiles: bool,
    /// Panic on usage errors instead of only logging them.
    pub strict_usage: bool,
    /// Basename prefixes of libraries whose allocations are exempt.
    pub system_libraries: Vec<String>,
    /// Whole-program level requested via `HEAPCHECK`, if any.
    pub level: Option<Strictness>,
    /// Policy used when the level is `as-is`.
    pub whole_program: WholeProgramPolicy,
    pub suspend_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            report: true,
            pprof_path: None,
            dump_directory: std::env::temp_dir(),
            dump_profiles: true,
            strict_usage: false,
            system_libraries: DEFAULT_SYSTEM_LIBRARIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            level: None,
            whole_program: WholeProgramPolicy::NORMAL,
            suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
        }
    }
}

impl Config {
    /// Build a config from `HEAPCHECK*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(level) = lookup("HEAPCHECK").filter(|v| !v.is_empty()) {
            config.level = Some(level.parse()?);
        }
        if let Some(v) = lookup("HEAPCHECK_REPORT") {
            config.report = parse_bool(&v);
        }
        if let Some(v) = lookup("HEAPCHECK_PPROF").filter(|v| !v.is_empty()) {
            config.pprof_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HEAPCHECK_DUMP_DIR").filter(|v| !v.is_empty()) {
            config.dump_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("HEAPCHECK_DUMP") {
            config.dump_profiles = parse_bool(&v);
        }
        if let Some(v) = lookup("HEAPCHECK_STRICT_USAGE") {
            config.strict_usage = parse_bool(&v);
        }
        if let Some(v) = lookup("HEAPCHECK_SYSTEM_LIBS") {
            config.system_libraries = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("HEAPCHECK_SUSPEND_TIMEOUT") {
            config.suspend_timeout = humantime::parse_duration(&v)
                .map_err(|e| Error::InvalidConfig(format!("HEAPCHECK_SUSPEND_TIMEOUT: {}", e)))?;
        }

        Ok(config)
    }

    pub fn with_report(mut self, report: bool) -> Self {
        self.report = report;
        self
    }

    pub fn with_pprof_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pprof_path = Some(path.into());
        self
    }

    pub fn with_dump_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_directory = dir.into();
        self
    }

    pub fn with_dump_profiles(mut self, dump: bool) -> Self {
        self.dump_profiles = dump;
        self
    }

    pub fn with_strict_usage(mut self, strict: bool) -> Self {
        self.strict_usage = strict;
        self
    }

    pub fn with_system_libraries<I, S>(mut self, libs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_libraries = libs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_level(mut self, level: Strictness) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_whole_program(mut self, policy: WholeProgramPolicy) -> Self {
        self.whole_program = policy;
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    /// The policy the whole-program check runs under, if one was requested.
    pub fn effective_policy(&self) -> Option<WholeProgramPolicy> {
        self.level.and_then(|level| level.resolve(&self.whole_program))
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
