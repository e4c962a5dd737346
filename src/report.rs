//! Progress of a batch, recomputed from the output tree on every call.
//!
//! The output tree is the only source of truth, so nothing is cached
//! between runs and two runs over an unchanged tree agree.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use humansize::{BINARY, format_size};
use serde::Serialize;
use walkdir::WalkDir;

use crate::claim;
use crate::config::ReportConfig;
use crate::packages;
use crate::worker::OutputLayout;

/// A ratio shown with one decimal, e.g. `80.0%`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percent(pub f64);

impl Percent {
    pub fn of(part: usize, total: usize) -> Option<Self> {
        (total > 0).then(|| Percent(part as f64 / total as f64 * 100.0))
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub files: usize,
    pub bytes: u64,
}

/// Everything derived from the output tree alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputCounts {
    /// Size of the package list, when one was given.
    pub total_packages: Option<usize>,
    /// Unique package directories under `all/` (only listed names when a list is given).
    pub attempted: usize,
    pub attempted_percent: Option<Percent>,
    /// Claimed but not marked done: still running, or its worker died.
    pub in_progress: usize,
    /// Directories under `all/` whose name is not on the list.
    pub unlisted: usize,
    /// Packages with at least one Wasm binary (listed ones only, as for `attempted`).
    pub built: usize,
    /// Packages with at least one Wasm binary carrying DWARF.
    pub with_debug_info: usize,
    pub with_debug_info_percent: Option<Percent>,
    /// Harvested binaries under `wasm/`, by extension.
    pub wasm_files: BTreeMap<String, TypeCount>,
    /// Harvested binaries under `wasm-dwarf/`, by extension.
    pub wasm_dwarf_files: BTreeMap<String, TypeCount>,
    /// Bytes per top-level output directory.
    pub disk_usage: BTreeMap<String, u64>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogFreshness {
    pub name: String,
    pub bytes: u64,
    /// Seconds since the Unix epoch.
    pub modified: u64,
    pub age_secs: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub counts: OutputCounts,
    pub workers: Vec<LogFreshness>,
}

/// Compute the report as of `now`.
pub fn compute(config: &ReportConfig, now: SystemTime) -> Result<ProgressReport> {
    let counts = output_counts(&config.output_dir, config.package_list.as_deref())?;
    let workers = match &config.log_pattern {
        Some(pattern) => {
            let (dir, prefix, suffix) = pattern.split();
            log_freshness(&dir, &prefix, &suffix, now, config.stale_after)?
        }
        None => Vec::new(),
    };
    Ok(ProgressReport { counts, workers })
}

fn subdir_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn output_counts(output_dir: &Path, package_list: Option<&Path>) -> Result<OutputCounts> {
    let layout = OutputLayout::new(output_dir);
    let listed: Option<HashSet<String>> = package_list
        .map(packages::read_list)
        .transpose()?
        .map(|list| list.into_iter().collect());

    let mut counts = OutputCounts {
        total_packages: listed.as_ref().map(HashSet::len),
        ..Default::default()
    };

    for name in subdir_names(&layout.all)? {
        if listed.as_ref().is_some_and(|l| !l.contains(&name)) {
            counts.unlisted += 1;
            continue;
        }
        counts.attempted += 1;
        if !claim::is_done(&layout.all.join(&name)) {
            counts.in_progress += 1;
        }
    }
    let on_list = |name: &String| listed.as_ref().is_none_or(|l| l.contains(name));
    counts.built = subdir_names(&layout.success)?.iter().filter(|n| on_list(n)).count();
    counts.with_debug_info = subdir_names(&layout.wasm_dwarf)?
        .iter()
        .filter(|n| on_list(n))
        .count();
    counts.attempted_percent = counts
        .total_packages
        .and_then(|total| Percent::of(counts.attempted, total));
    counts.with_debug_info_percent = Percent::of(counts.with_debug_info, counts.attempted);

    counts.wasm_files = files_by_type(&layout.wasm);
    counts.wasm_dwarf_files = files_by_type(&layout.wasm_dwarf);

    if output_dir.exists() {
        for entry in fs::read_dir(output_dir)
            .with_context(|| format!("failed to read {}", output_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = disk_usage(&entry.path());
            counts.total_bytes += bytes;
            counts.disk_usage.insert(name, bytes);
        }
    }
    Ok(counts)
}

fn extension_key(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "(none)".to_string())
}

fn files_by_type(root: &Path) -> BTreeMap<String, TypeCount> {
    let mut by_type: BTreeMap<String, TypeCount> = BTreeMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let count = by_type.entry(extension_key(entry.path())).or_default();
        count.files += 1;
        count.bytes += bytes;
    }
    by_type
}

/// Apparent size of all regular files below `path`; symlinks are not followed.
fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Whether `name` is `<prefix><index><suffix>` for a decimal index.
pub fn is_worker_log(name: &str, prefix: &str, suffix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|n| n.strip_suffix(suffix))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

fn log_index(name: &str, prefix: &str, suffix: &str) -> usize {
    name.strip_prefix(prefix)
        .and_then(|n| n.strip_suffix(suffix))
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

fn log_freshness(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    now: SystemTime,
    stale_after: Duration,
) -> Result<Vec<LogFreshness>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_worker_log(&name, prefix, suffix) {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta.modified()?;
        let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
        logs.push(LogFreshness {
            name,
            bytes: meta.len(),
            modified: mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            age_secs: age.as_secs(),
            stale: age > stale_after,
        });
    }
    logs.sort_by_key(|l| log_index(&l.name, prefix, suffix));
    Ok(logs)
}

fn fmt_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

fn fmt_percent(p: Option<Percent>) -> String {
    p.map(|p| format!(" ({p})")).unwrap_or_default()
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        if !self.workers.is_empty() {
            writeln!(f, "worker logs:")?;
            for w in &self.workers {
                writeln!(
                    f,
                    "  {:<20} {:>10}  modified {:>7} ago{}",
                    w.name,
                    format_size(w.bytes, BINARY),
                    fmt_age(w.age_secs),
                    if w.stale { "  STALE" } else { "" }
                )?;
            }
        }

        match c.total_packages {
            Some(total) => writeln!(
                f,
                "attempted:       {}/{}{}",
                c.attempted,
                total,
                fmt_percent(c.attempted_percent)
            )?,
            None => writeln!(f, "attempted:       {}", c.attempted)?,
        }
        writeln!(f, "in progress:     {}", c.in_progress)?;
        if c.unlisted > 0 {
            writeln!(f, "unlisted:        {}", c.unlisted)?;
        }
        writeln!(
            f,
            "built:           {}/{}{}",
            c.built,
            c.attempted,
            fmt_percent(Percent::of(c.built, c.attempted))
        )?;
        writeln!(
            f,
            "with debug info: {}/{}{}",
            c.with_debug_info,
            c.attempted,
            fmt_percent(c.with_debug_info_percent)
        )?;

        for (title, files) in [("wasm/", &c.wasm_files), ("wasm-dwarf/", &c.wasm_dwarf_files)] {
            let total: usize = files.values().map(|t| t.files).sum();
            writeln!(f, "files in {title}: {total}")?;
            for (ext, t) in files {
                writeln!(
                    f,
                    "  .{:<10} {:>8} {:>12}",
                    ext,
                    t.files,
                    format_size(t.bytes, BINARY)
                )?;
            }
        }

        writeln!(f, "disk usage:      {}", format_size(c.total_bytes, BINARY))?;
        for (dir, bytes) in &c.disk_usage {
            writeln!(f, "  {:<14} {:>12}", dir, format_size(*bytes, BINARY))?;
        }
        Ok(())
    }
}
