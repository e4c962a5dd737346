//! Launch N workers over one package list and wait for all of them.
//!
//! Workers are independent processes; the only thing they share is the
//! filesystem. Each worker leads its own process group, and so does each
//! build step a worker starts. Cancelling therefore walks every worker's
//! subprocess tree and signals every group found in it, not just the
//! direct children.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpgrp};
use tracing::{debug, info, warn};

use crate::config::{SupervisorConfig, WORKER_INDEX_ENV, WorkerCommand};
use crate::inspect::ProcessTable;
use crate::packages;
use crate::process::kill_group;

struct Worker {
    index: usize,
    child: Child,
    log: PathBuf,
    status: Option<ExitStatus>,
    /// Log mtime when the watchdog last flagged this worker.
    flagged_at: Option<SystemTime>,
    stale_flags: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: u32,
    pub log: PathBuf,
    pub status: Option<ExitStatus>,
    /// How often the watchdog found this worker's log stale.
    pub stale_flags: usize,
}

/// What happened to each worker. Success or failure of the packages is only
/// visible in the worker logs and the output tree.
#[derive(Debug, Clone)]
pub struct SupervisorSummary {
    pub spawned: usize,
    pub cancelled: bool,
    pub exits: Vec<WorkerExit>,
}

/// Run the whole batch. Returns once every spawned worker has exited.
pub fn run(config: &SupervisorConfig, cancel: &AtomicBool) -> Result<SupervisorSummary> {
    config.validate()?;

    // Generate the list once here, instead of letting N workers race to do it.
    let list = packages::load_or_generate(&config.package_list, packages::apt_package_names)?;
    info!(
        packages = list.len(),
        workers = config.workers,
        list = %config.package_list.display(),
        "starting workers"
    );

    let mut workers: Vec<Worker> = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        if cancel.load(Ordering::SeqCst) {
            warn!(spawned = workers.len(), "interrupted while starting workers");
            break;
        }
        match spawn_worker(config, index) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                warn!(index, err = %e, "failed to spawn worker, stopping the others");
                terminate_all(&mut workers, config.grace);
                return Err(e);
            }
        }
        if index + 1 < config.workers {
            interruptible_sleep(config.stagger, cancel);
        }
    }

    let spawned = workers.len();
    let cancelled = wait_all(&mut workers, config, cancel);

    let exits = workers
        .into_iter()
        .map(|w| WorkerExit {
            index: w.index,
            pid: w.child.id(),
            log: w.log,
            status: w.status,
            stale_flags: w.stale_flags,
        })
        .collect::<Vec<_>>();
    for exit in &exits {
        info!(
            index = exit.index,
            pid = exit.pid,
            code = ?exit.status.and_then(|s| s.code()),
            log = %exit.log.display(),
            "worker exited"
        );
    }
    info!(spawned, cancelled, "all workers finished");
    Ok(SupervisorSummary {
        spawned,
        cancelled,
        exits,
    })
}

fn spawn_worker(config: &SupervisorConfig, index: usize) -> Result<Worker> {
    let log = config.log_pattern.path_for(index);
    if let Some(parent) = log.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let child = Command::new(&config.command.program)
        .args(&config.command.args)
        .arg("--package-list")
        .arg(&config.package_list)
        .arg("--shuffle")
        .arg("--logfile")
        .arg(&log)
        .env(WORKER_INDEX_ENV, index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| {
            format!(
                "failed to spawn worker {index} ({})",
                config.command.program.display()
            )
        })?;

    info!(index, pid = child.id(), log = %log.display(), "spawned worker");
    Ok(Worker {
        index,
        child,
        log,
        status: None,
        flagged_at: None,
        stale_flags: 0,
    })
}

/// Poll until all workers exit. Returns whether cancellation was requested.
fn wait_all(workers: &mut [Worker], config: &SupervisorConfig, cancel: &AtomicBool) -> bool {
    loop {
        reap(workers);
        if workers.iter().all(|w| w.status.is_some()) {
            return cancel.load(Ordering::SeqCst);
        }
        if cancel.load(Ordering::SeqCst) {
            info!("interrupt received, terminating all workers and their subprocesses");
            terminate_all(workers, config.grace);
            return true;
        }
        if let Some(threshold) = config.stale_after {
            watchdog(workers, threshold);
        }
        thread::sleep(config.poll_interval);
    }
}

fn reap(workers: &mut [Worker]) {
    for w in workers.iter_mut().filter(|w| w.status.is_none()) {
        match w.child.try_wait() {
            Ok(Some(status)) => {
                debug!(index = w.index, ?status, "worker exited");
                w.status = Some(status);
            }
            Ok(None) => {}
            Err(e) => warn!(index = w.index, err = %e, "failed to poll worker"),
        }
    }
}

/// Flag workers whose log has not changed for longer than `threshold`.
///
/// Only warns: a quiet build step is not necessarily a hung one.
fn watchdog(workers: &mut [Worker], threshold: Duration) {
    for w in workers.iter_mut().filter(|w| w.status.is_none()) {
        let Ok(mtime) = fs::metadata(&w.log).and_then(|m| m.modified()) else {
            continue;
        };
        let idle = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        if idle > threshold && w.flagged_at != Some(mtime) {
            warn!(
                index = w.index,
                pid = w.child.id(),
                idle_secs = idle.as_secs(),
                log = %w.log.display(),
                "worker log is stale; inspect with `wasm-farm ps --log {}`",
                w.log.display()
            );
            w.flagged_at = Some(mtime);
            w.stale_flags += 1;
        }
    }
}

/// Process groups of every live worker and all of their descendants.
///
/// Never includes our own group.
fn subtree_groups(workers: &[Worker]) -> BTreeSet<u32> {
    let table = ProcessTable::snapshot();
    let own = getpgrp().as_raw() as u32;
    let mut groups = BTreeSet::new();
    for w in workers.iter().filter(|w| w.status.is_none()) {
        // each worker leads its own group
        groups.insert(w.child.id());
        groups.extend(
            table
                .descendants(w.child.id())
                .into_iter()
                .filter_map(|(_, p)| p.pgid),
        );
    }
    groups.remove(&own);
    groups
}

fn signal_groups(groups: &BTreeSet<u32>, signal: Signal) {
    for &pgid in groups {
        if kill_group(Pid::from_raw(pgid as i32), signal) {
            debug!(pgid, ?signal, "signalled process group");
        }
    }
}

/// Cancel every worker's ownership subtree: SIGTERM, grace period, SIGKILL.
fn terminate_all(workers: &mut [Worker], grace: Duration) {
    // Snapshot before anything dies: once a worker exits, its steps are
    // reparented and can no longer be found through it.
    let mut groups = subtree_groups(workers);
    signal_groups(&groups, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        reap(workers);
        if workers.iter().all(|w| w.status.is_some()) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    // Steps started during the grace period belong to groups we have not seen yet.
    groups.extend(subtree_groups(workers));
    signal_groups(&groups, Signal::SIGKILL);

    for w in workers.iter_mut().filter(|w| w.status.is_none()) {
        match w.child.wait() {
            Ok(status) => w.status = Some(status),
            Err(e) => warn!(index = w.index, err = %e, "failed to wait for worker"),
        }
    }
}

fn interruptible_sleep(total: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !cancel.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

/// The default worker program: this very binary's `work` subcommand.
pub fn self_worker_command() -> Result<WorkerCommand> {
    let program = std::env::current_exe().context("failed to locate own executable")?;
    Ok(WorkerCommand {
        program,
        args: vec!["work".into()],
    })
}
