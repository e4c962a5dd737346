//! Error types callers need to tell apart.
//!
//! Application seams use `anyhow`; these enums cover the cases where the
//! caller branches on the kind of failure (bad configuration, a package
//! that cannot be built, a cancelled step).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid command-line or programmatic configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("{requested} workers requested, at most {max} are supported")]
    TooManyWorkers { requested: usize, max: usize },

    #[error("'{0}' is not a range in the format N..N")]
    InvalidRange(String),

    #[error("end of range {start}..{end} is not greater than start")]
    EmptyRange { start: usize, end: usize },

    #[error("log pattern '{0}' must contain '{{}}' for the worker index")]
    LogPattern(String),

    #[error("empty command for {0}")]
    EmptyCommand(&'static str),

    #[error("invalid exclude pattern '{pattern}': {reason}")]
    ExcludePattern { pattern: String, reason: String },
}

/// Why a single package could not be processed.
///
/// These are logged and the worker moves on to the next package, except
/// for `Interrupted`, which stops the worker.
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("unzipped directory for sources not found")]
    NoSourceDir,

    #[error("more than one unzipped directory for sources: {0:?}")]
    MultipleSourceDirs(Vec<PathBuf>),

    #[error("no C/C++ source files found")]
    NoCSources,

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PackageError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PackageError::Interrupted)
    }
}
