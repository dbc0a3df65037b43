use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0:#x} is not a live heap object")]
    NotLive(usize),

    #[error("{0:#x} is already ignored")]
    AlreadyIgnored(usize),

    #[error("{0:#x} was never ignored")]
    NotIgnored(usize),

    #[error("ignored object {0:#x} was freed while still ignored")]
    IgnoredObjectFreed(usize),

    #[error("checker '{0}' was already verified; each checker allows one *NoLeaks/*SameHeap call")]
    AlreadyVerified(String),

    #[error("checker '{0}' was dropped without calling any *NoLeaks/*SameHeap method")]
    NeverVerified(String),

    #[error("invalid checker name '{0}': must be non-empty and usable as part of a file name")]
    InvalidName(String),

    #[error("invalid address range {start:#x}..{end:#x}")]
    InvalidRange { start: usize, end: usize },

    #[error("unknown heap check level '{0}' (expected minimal, normal, strict, draconian, as-is or local)")]
    InvalidStrictness(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid ignore pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("could not capture the caller's stack frame")]
    NoCallerFrame,

    #[error("memory map unavailable: {0}")]
    MapsUnavailable(String),

    #[error("profile renderer failed: {0}")]
    Renderer(String),

    #[error("malformed heap dump {path}: {reason}")]
    Dump { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the caller broke the checker's contract, as
    /// opposed to the environment getting in the way.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::NotLive(_)
                | Error::AlreadyIgnored(_)
                | Error::NotIgnored(_)
                | Error::IgnoredObjectFreed(_)
                | Error::AlreadyVerified(_)
                | Error::NeverVerified(_)
                | Error::InvalidName(_)
                | Error::InvalidRange { .. }
                | Error::InvalidStrictness(_)
                | Error::InvalidPattern(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidStrictness(_) | Error::InvalidConfig(_) | Error::InvalidPattern(_) => {
                exit_code::INVALID_ARGUMENTS
            }
            Error::Dump { .. } => exit_code::MALFORMED_DUMP,
            Error::Renderer(_) => exit_code::RENDERER_ERROR,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const LEAKS_FOUND: i32 = 1;
    pub const GENERAL_ERROR: i32 = 2;
    pub const INVALID_ARGUMENTS: i32 = 3;
    pub const MALFORMED_DUMP: i32 = 4;
    pub const RENDERER_ERROR: i32 = 5;
}
