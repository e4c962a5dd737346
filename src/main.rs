use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use nix::sys::signal::Signal;
use tracing::{info, warn};

use wasm_farm::config::{
    self, LogPattern, ReportConfig, SupervisorConfig, Toolchain, WORKER_INDEX_ENV, WorkerCommand,
    WorkerConfig,
};
use wasm_farm::inspect::{self, ProcessTable};
use wasm_farm::logfile::{self, LogFile};
use wasm_farm::packages::{self, Selection};
use wasm_farm::process::CancelFlag;
use wasm_farm::{report, supervisor, worker};

#[derive(Parser, Debug)]
#[command(
    name = "wasm-farm",
    about = "Compile source packages to Wasm with debug info using parallel workers",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch N workers over a package list and wait for all of them
    Supervise {
        /// Number of worker processes
        #[arg(short = 'w', long, default_value_t = config::DEFAULT_WORKERS)]
        workers: usize,
        /// Newline-delimited package list shared by all workers
        #[arg(long, default_value = "packages.list")]
        package_list: PathBuf,
        /// Per-worker log file; `{}` is replaced by the worker index
        #[arg(long, default_value = config::DEFAULT_LOG_PATTERN)]
        log_pattern: String,
        /// Delay between two worker starts, in milliseconds
        #[arg(long, default_value_t = 1000)]
        stagger_ms: u64,
        /// Seconds between SIGTERM and SIGKILL when interrupted
        #[arg(long, default_value_t = 5)]
        grace_secs: u64,
        /// Warn when a worker log has not changed for this many minutes
        #[arg(long)]
        stale_after_mins: Option<u64>,
        /// Worker program (default: this binary's `work` subcommand)
        #[arg(long)]
        worker_program: Option<PathBuf>,
        /// Extra arguments for every worker, after `--`
        #[arg(last = true)]
        worker_args: Vec<OsString>,
    },
    /// Process packages one by one (normally started by `supervise`)
    Work {
        #[arg(long, default_value = "packages.list")]
        package_list: PathBuf,
        /// Directory for per-package logs, sources and binaries
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Process only entries N..M of the package list (end exclusive)
        #[arg(long, value_name = "N..M", value_parser = packages::parse_range)]
        range: Option<(usize, usize)>,
        /// Shuffle the packages so related ones are not built back to back
        #[arg(long, default_value_t = false)]
        shuffle: bool,
        /// Shuffle seed; offset by the worker index when run under `supervise`
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, env = WORKER_INDEX_ENV, hide = true, default_value_t = 0)]
        worker_index: u64,
        /// Process only N random packages of the list
        #[arg(long, value_name = "N")]
        random_sample: Option<usize>,
        /// Keep the src/ directory of every package
        #[arg(long, default_value_t = false)]
        keep_src: bool,
        /// Also write log output to this file
        #[arg(long)]
        logfile: Option<PathBuf>,
        /// Skip packages matching this regex (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
        /// Do not apply the built-in kernel/locale/font exclusions
        #[arg(long, default_value_t = false)]
        no_default_excludes: bool,
        #[arg(long, default_value = "apt-get source")]
        fetch_cmd: String,
        #[arg(long, default_value = "emconfigure ./configure")]
        configure_cmd: String,
        #[arg(long, default_value = "emcmake cmake .")]
        cmake_cmd: String,
        #[arg(long, default_value = "emmake make")]
        make_cmd: String,
        /// Minutes before configure is killed (0 = never)
        #[arg(long, default_value_t = 20)]
        configure_timeout_mins: u64,
        /// Minutes before cmake is killed (0 = never)
        #[arg(long, default_value_t = 20)]
        cmake_timeout_mins: u64,
        /// Minutes before make is killed (0 = never)
        #[arg(long, default_value_t = 90)]
        make_timeout_mins: u64,
    },
    /// Summarize progress from the output tree and worker logs
    Report {
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Package list to compute completion against
        #[arg(long)]
        package_list: Option<PathBuf>,
        /// Worker log pattern, as given to `supervise`
        #[arg(long)]
        log_pattern: Option<String>,
        /// Mark logs unchanged for this many minutes as stale
        #[arg(long, default_value_t = 30)]
        stale_after_mins: u64,
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the process writing a worker log and its subprocess tree
    Ps {
        #[arg(long)]
        log: PathBuf,
    },
    /// Signal the process group of one build step below a worker
    KillStep {
        /// Worker log identifying the worker
        #[arg(long, required_unless_present = "worker")]
        log: Option<PathBuf>,
        /// Worker pid, instead of looking it up through --log
        #[arg(long)]
        worker: Option<u32>,
        /// Substring of the step's name or command line
        #[arg(long, required_unless_present = "pid")]
        pattern: Option<String>,
        /// Pid of the step
        #[arg(long, conflicts_with = "pattern")]
        pid: Option<u32>,
        #[arg(long, value_enum, default_value_t = SignalFlag::Kill)]
        signal: SignalFlag,
        /// Print what would be signalled without doing it
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SignalFlag {
    Term,
    Kill,
    Int,
}

impl From<SignalFlag> for Signal {
    fn from(value: SignalFlag) -> Self {
        match value {
            SignalFlag::Term => Signal::SIGTERM,
            SignalFlag::Kill => Signal::SIGKILL,
            SignalFlag::Int => Signal::SIGINT,
        }
    }
}

fn cancel_on_signal() -> Result<CancelFlag> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to set signal handler")?;
    Ok(cancel)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Supervise {
            workers,
            package_list,
            log_pattern,
            stagger_ms,
            grace_secs,
            stale_after_mins,
            worker_program,
            worker_args,
        } => {
            logfile::init_tracing(args.verbose, None);
            let command = match worker_program {
                Some(program) => WorkerCommand {
                    program,
                    args: worker_args,
                },
                None => {
                    let mut command = supervisor::self_worker_command()?;
                    command.args.extend(worker_args);
                    command
                }
            };
            let config = SupervisorConfig {
                workers,
                package_list,
                log_pattern: LogPattern::new(log_pattern)?,
                command,
                stagger: Duration::from_millis(stagger_ms),
                grace: Duration::from_secs(grace_secs),
                poll_interval: Duration::from_millis(500),
                stale_after: stale_after_mins.and_then(config::minutes),
            };
            let cancel = cancel_on_signal()?;
            let summary = supervisor::run(&config, &cancel)?;
            info!(
                spawned = summary.spawned,
                cancelled = summary.cancelled,
                "supervisor done"
            );
        }
        Commands::Work {
            package_list,
            output_dir,
            range,
            shuffle,
            seed,
            worker_index,
            random_sample,
            keep_src,
            logfile: log_path,
            exclude,
            no_default_excludes,
            fetch_cmd,
            configure_cmd,
            cmake_cmd,
            make_cmd,
            configure_timeout_mins,
            cmake_timeout_mins,
            make_timeout_mins,
        } => {
            let log = log_path.map(LogFile::open).transpose()?.map(Arc::new);
            logfile::init_tracing(args.verbose, log);

            let mut patterns: Vec<String> = if no_default_excludes {
                Vec::new()
            } else {
                packages::DEFAULT_EXCLUDES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            };
            patterns.extend(exclude);

            let toolchain = Toolchain {
                configure_timeout: config::minutes(configure_timeout_mins),
                cmake_timeout: config::minutes(cmake_timeout_mins),
                make_timeout: config::minutes(make_timeout_mins),
                ..Toolchain::from_lines(&fetch_cmd, &configure_cmd, &cmake_cmd, &make_cmd)?
            };
            let config = WorkerConfig {
                package_list,
                output_dir,
                selection: Selection {
                    excludes: packages::compile_excludes(&patterns)?,
                    range,
                    random_sample,
                    shuffle,
                    seed: seed.map(|s| s.wrapping_add(worker_index)),
                },
                keep_src,
                toolchain,
            };
            info!(worker_index, ?config, "starting worker");
            let cancel = cancel_on_signal()?;
            let summary = worker::run_worker(&config, &cancel)?;
            if summary.interrupted {
                warn!("worker interrupted");
            }
        }
        Commands::Report {
            output_dir,
            package_list,
            log_pattern,
            stale_after_mins,
            json,
        } => {
            logfile::init_tracing(args.verbose, None);
            let config = ReportConfig {
                output_dir,
                package_list,
                log_pattern: log_pattern.map(LogPattern::new).transpose()?,
                stale_after: Duration::from_secs(stale_after_mins * 60),
            };
            let report = report::compute(&config, SystemTime::now())?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("failed to serialize report")?
                );
            } else {
                print!("{report}");
            }
        }
        Commands::Ps { log } => {
            logfile::init_tracing(args.verbose, None);
            let writers = inspect::log_writers(&log)?;
            if writers.is_empty() {
                println!("no process has {} open", log.display());
                return Ok(());
            }
            let table = ProcessTable::snapshot();
            for pid in writers {
                print_tree(&table, pid);
            }
        }
        Commands::KillStep {
            log,
            worker,
            pattern,
            pid,
            signal,
            dry_run,
        } => {
            logfile::init_tracing(args.verbose, None);
            let worker = match (worker, log) {
                (Some(worker), _) => worker,
                (None, Some(log)) => single_writer(&log)?,
                (None, None) => return Err(anyhow!("pass --log or --worker")),
            };
            let table = ProcessTable::snapshot();
            let target = match (pid, pattern) {
                (Some(pid), _) => pid,
                (None, Some(pattern)) => pick_step(&table, worker, &pattern)?,
                (None, None) => return Err(anyhow!("pass --pattern or --pid")),
            };
            let outcome =
                inspect::kill_step_group(&table, worker, target, signal.into(), dry_run)?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}

fn single_writer(log: &Path) -> Result<u32> {
    match inspect::log_writers(log)?.as_slice() {
        [pid] => Ok(*pid),
        [] => Err(anyhow!("no process has {} open", log.display())),
        many => Err(anyhow!(
            "several processes have {} open: {:?}; pass --worker",
            log.display(),
            many
        )),
    }
}

/// The step to signal: all matches must share one process group.
fn pick_step(table: &ProcessTable, worker: u32, pattern: &str) -> Result<u32> {
    let matches = table.find_step(worker, pattern);
    let Some(first) = matches.first() else {
        return Err(anyhow!("no subprocess of {worker} matches '{pattern}'"));
    };
    if matches.iter().any(|p| p.pgid != first.pgid) {
        let listed: Vec<String> = matches
            .iter()
            .map(|p| format!("{} (group {:?}) {}", p.pid, p.pgid, p.cmd))
            .collect();
        return Err(anyhow!(
            "'{pattern}' matches processes in several groups, pass --pid:\n  {}",
            listed.join("\n  ")
        ));
    }
    Ok(first.pid)
}

fn print_tree(table: &ProcessTable, root: u32) {
    let line = |depth: usize, p: &inspect::ProcessInfo| {
        println!(
            "{}{} pgid={} {}s {} [{}]",
            "  ".repeat(depth),
            p.pid,
            p.pgid.map(|g| g.to_string()).unwrap_or_else(|| "?".into()),
            p.run_time,
            p.name,
            p.cmd
        );
    };
    match table.get(root) {
        Some(p) => line(0, p),
        None => println!("{root} (exited)"),
    }
    for (depth, p) in table.descendants(root) {
        line(depth, p);
    }
}
