//! Operator tooling: who writes a log, what is it running, and how to stop
//! one stuck build step without taking the worker down with it.
//!
//! Nothing here acts on its own. Build hangs have package-specific causes,
//! so deciding that a quiet step is stuck is left to a human.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpgid, getpgrp};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::process::kill_group;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub pgid: Option<u32>,
    pub name: String,
    pub cmd: String,
    /// Seconds since the process started.
    pub run_time: u64,
}

impl ProcessInfo {
    pub fn matches(&self, pattern: &str) -> bool {
        self.name.contains(pattern) || self.cmd.contains(pattern)
    }
}

/// A point-in-time view of all processes on the host.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<u32, ProcessInfo>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTable {
    pub fn snapshot() -> Self {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        Self::from_processes(sys.processes().values().map(|p| {
            let pid = p.pid().as_u32();
            ProcessInfo {
                pid,
                parent: p.parent().map(|pp| pp.as_u32()),
                pgid: getpgid(Some(Pid::from_raw(pid as i32)))
                    .ok()
                    .map(|g| g.as_raw() as u32),
                name: p.name().to_string_lossy().into_owned(),
                cmd: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
                run_time: p.run_time(),
            }
        }))
    }

    pub fn from_processes(processes: impl IntoIterator<Item = ProcessInfo>) -> Self {
        let mut table = Self::default();
        for info in processes {
            if let Some(parent) = info.parent {
                table.children.entry(parent).or_default().push(info.pid);
            }
            table.processes.insert(info.pid, info);
        }
        for kids in table.children.values_mut() {
            kids.sort_unstable();
        }
        table
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    /// All descendants of `root` in breadth-first order, with their depth (children = 1).
    pub fn descendants(&self, root: u32) -> Vec<(usize, &ProcessInfo)> {
        let mut out = Vec::new();
        let mut queue: VecDeque<(usize, u32)> = VecDeque::from([(0, root)]);
        while let Some((depth, pid)) = queue.pop_front() {
            for child in self.children.get(&pid).into_iter().flatten() {
                if let Some(info) = self.processes.get(child) {
                    out.push((depth + 1, info));
                    queue.push_back((depth + 1, *child));
                }
            }
        }
        out
    }

    /// Descendants of `worker` whose name or command line contains `pattern`.
    pub fn find_step(&self, worker: u32, pattern: &str) -> Vec<&ProcessInfo> {
        self.descendants(worker)
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.matches(pattern))
            .collect()
    }
}

/// Processes holding `log` open for writing (Linux `/proc/<pid>/fd`).
///
/// Readers such as `tail -f` are not writers. Processes we may not inspect
/// are skipped silently.
pub fn log_writers(log: &Path) -> Result<Vec<u32>> {
    let target = fs::canonicalize(log)
        .with_context(|| format!("failed to resolve log file {}", log.display()))?;
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").context("failed to read /proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let proc_dir = entry.path();
        let Ok(fds) = fs::read_dir(proc_dir.join("fd")) else {
            continue;
        };
        let writes = fds.filter_map(|fd| fd.ok()).any(|fd| {
            fs::read_link(fd.path()).is_ok_and(|link| link == target)
                && opened_for_writing(&proc_dir.join("fdinfo").join(fd.file_name()))
        });
        if writes {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    debug!(log = %log.display(), ?pids, "log writers");
    Ok(pids)
}

/// Whether an `fdinfo` entry shows a write or read-write access mode.
fn opened_for_writing(fdinfo: &Path) -> bool {
    let Ok(info) = fs::read_to_string(fdinfo) else {
        return false;
    };
    info.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|flags| i32::from_str_radix(flags.trim(), 8).ok())
        .map(OFlag::from_bits_truncate)
        .is_some_and(|flags| {
            let mode = flags & OFlag::O_ACCMODE;
            mode == OFlag::O_WRONLY || mode == OFlag::O_RDWR
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled { pgid: u32 },
    DryRun { pgid: u32 },
    /// The group was already gone.
    Gone { pgid: u32 },
}

/// Signal the process group of `target`, a descendant of `worker`.
///
/// Refuses when that group also contains the worker or the caller, since
/// the point is to stop one step and let the worker carry on.
pub fn kill_step_group(
    table: &ProcessTable,
    worker: u32,
    target: u32,
    signal: Signal,
    dry_run: bool,
) -> Result<KillOutcome> {
    if !table.descendants(worker).iter().any(|(_, p)| p.pid == target) {
        return Err(anyhow!("process {target} is not a descendant of worker {worker}"));
    }
    let step = table
        .get(target)
        .ok_or_else(|| anyhow!("process {target} not found"))?;
    let pgid = step
        .pgid
        .ok_or_else(|| anyhow!("process group of {target} unknown"))?;
    let worker_pgid = table.get(worker).and_then(|w| w.pgid);
    if Some(pgid) == worker_pgid {
        return Err(anyhow!(
            "process {target} shares group {pgid} with worker {worker}; signalling it would stop the worker"
        ));
    }
    if pgid == getpgrp().as_raw() as u32 {
        return Err(anyhow!("process {target} is in our own process group {pgid}"));
    }

    if dry_run {
        info!(pgid, target, name = %step.name, "dry-run: would signal process group");
        return Ok(KillOutcome::DryRun { pgid });
    }
    if kill_group(Pid::from_raw(pgid as i32), signal) {
        info!(pgid, target, name = %step.name, ?signal, "signalled process group");
        Ok(KillOutcome::Signalled { pgid })
    } else {
        Ok(KillOutcome::Gone { pgid })
    }
}
