//! Runtime configuration for the supervisor, the workers and the reporter.
//!
//! `main.rs` parses flags with clap and builds these; validation happens here
//! so library callers (and tests) get the same checks as the CLI.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::packages::Selection;
use crate::process::CommandSpec;

/// Environment variable carrying a worker's index, set by the supervisor.
pub const WORKER_INDEX_ENV: &str = "WASM_FARM_WORKER_INDEX";

pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_LOG_PATTERN: &str = "logs/worker-{}.log";

/// Upper bound on `--workers`; far beyond this the stagger alone takes minutes.
const MAX_WORKERS: usize = 1024;

/// `0` disables a timeout.
pub fn minutes(m: u64) -> Option<Duration> {
    (m > 0).then(|| Duration::from_secs(m * 60))
}

/// Per-worker log path pattern; `{}` is replaced by the worker index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPattern(String);

impl LogPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        if !pattern.contains("{}") {
            return Err(ConfigError::LogPattern(pattern));
        }
        Ok(Self(pattern))
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        PathBuf::from(self.0.replace("{}", &index.to_string()))
    }

    /// Directory holding the logs and the file-name prefix/suffix around the index.
    pub fn split(&self) -> (PathBuf, String, String) {
        let path = Path::new(&self.0);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (prefix, suffix) = name.split_once("{}").unwrap_or((name.as_str(), ""));
        (dir, prefix.to_string(), suffix.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Commands and limits of the per-package build pipeline.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Receives the package name as last argument, runs inside `src/`.
    pub fetch: CommandSpec,
    pub configure: CommandSpec,
    pub cmake: CommandSpec,
    pub make: CommandSpec,
    /// Extra environment for make; `EMMAKEN_CFLAGS=-g` makes emcc emit DWARF.
    pub make_env: Vec<(String, String)>,
    pub configure_timeout: Option<Duration>,
    pub cmake_timeout: Option<Duration>,
    pub make_timeout: Option<Duration>,
}

impl Toolchain {
    pub fn from_lines(
        fetch: &str,
        configure: &str,
        cmake: &str,
        make: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            fetch: CommandSpec::parse(fetch, "fetch")?,
            configure: CommandSpec::parse(configure, "configure")?,
            cmake: CommandSpec::parse(cmake, "cmake")?,
            make: CommandSpec::parse(make, "make")?,
            ..Self::default()
        })
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        let spec = |program: &str, args: &[&str]| CommandSpec {
            program: program.into(),
            args: args.iter().map(OsString::from).collect(),
        };
        Self {
            fetch: spec("apt-get", &["source"]),
            configure: spec("emconfigure", &["./configure"]),
            cmake: spec("emcmake", &["cmake", "."]),
            make: spec("emmake", &["make"]),
            make_env: vec![("EMMAKEN_CFLAGS".to_string(), "-g".to_string())],
            // some configure checks (sleep, nanosleep) loop forever
            configure_timeout: minutes(20),
            cmake_timeout: minutes(20),
            make_timeout: minutes(90),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub package_list: PathBuf,
    pub output_dir: PathBuf,
    pub selection: Selection,
    pub keep_src: bool,
    pub toolchain: Toolchain,
}

/// What the supervisor launches for each worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Placed before the per-worker arguments.
    pub args: Vec<OsString>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: usize,
    pub package_list: PathBuf,
    pub log_pattern: LogPattern,
    pub command: WorkerCommand,
    /// Delay between two spawns, spreads the first claims.
    pub stagger: Duration,
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub grace: Duration,
    pub poll_interval: Duration,
    /// Warn about workers whose log has not changed for this long.
    pub stale_after: Option<Duration>,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers {
                requested: self.workers,
                max: MAX_WORKERS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub package_list: Option<PathBuf>,
    pub log_pattern: Option<LogPattern>,
    pub stale_after: Duration,
}
