//! One worker: walk the (shuffled) package list and try to build each
//! package to Wasm with debug info.
//!
//! Failures of a single package are logged and skipped. Only cancellation
//! stops the loop.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use humansize::{BINARY, format_size};
use tracing::{debug, error, info, warn};

use crate::claim::{self, Claim};
use crate::config::{Toolchain, WorkerConfig};
use crate::error::PackageError;
use crate::packages;
use crate::process::{Step, StepOutcome};
use crate::scan;

/// The four output directories below the output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub all: PathBuf,
    pub success: PathBuf,
    pub wasm: PathBuf,
    pub wasm_dwarf: PathBuf,
}

impl OutputLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            all: root.join("all"),
            success: root.join("success"),
            wasm: root.join("wasm"),
            wasm_dwarf: root.join("wasm-dwarf"),
        }
    }

    pub fn create(&self) -> Result<()> {
        for (dir, description) in [
            (&self.all, "all packages"),
            (&self.success, "successful builds"),
            (&self.wasm, "Wasm binaries only"),
            (&self.wasm_dwarf, "Wasm binaries with DWARF info"),
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            info!(dir = %dir.display(), "output directory for {description}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Packages this worker claimed and processed.
    pub processed: Vec<String>,
    /// Packages already claimed by someone else.
    pub skipped: usize,
    /// Packages that produced at least one Wasm binary.
    pub built: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageOutcome {
    pub wasm_files: usize,
    pub with_dwarf: usize,
}

pub fn run_worker(config: &WorkerConfig, cancel: &AtomicBool) -> Result<WorkerSummary> {
    let list = packages::load_or_generate(&config.package_list, packages::apt_package_names)?;
    info!(count = list.len(), "packages available");
    let list = config.selection.apply(list);

    let layout = OutputLayout::new(&config.output_dir);
    layout.create()?;
    info!("starting...");

    let mut summary = WorkerSummary::default();
    let total = list.len();
    for (i, package) in list.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }
        info!(
            "package {package} ({i}/{total}, {:.1}%)",
            i as f64 / total as f64 * 100.0
        );

        let dir = match claim::claim(&layout.all, package) {
            Ok(Claim::Acquired(dir)) => dir,
            Ok(Claim::Taken) => {
                info!(package, "directory exists, skipping");
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                error!(package, "cannot claim package: {e:#}");
                continue;
            }
        };

        let result = process_package(package, &dir, &layout, config, cancel);
        // whatever the step reported, a raised flag means the package was not finished
        if matches!(result, Err(PackageError::Interrupted)) || cancel.load(Ordering::SeqCst) {
            warn!(package, "interrupted, releasing claim so the next run retries it");
            if let Err(e) = claim::release(&dir) {
                error!(package, err = %e, "failed to release claim");
            }
            summary.interrupted = true;
            break;
        }
        match result {
            Ok(outcome) => {
                if outcome.wasm_files > 0 {
                    summary.built += 1;
                }
            }
            Err(e) => error!(package, "{e}"),
        }

        let src = dir.join("src");
        if !config.keep_src && src.exists() {
            info!(dir = %src.display(), "removing sources");
            if let Err(e) = fs::remove_dir_all(&src) {
                error!(dir = %src.display(), err = %e, "failed to remove sources");
            }
        }
        if let Err(e) = claim::mark_done(&dir) {
            error!(package, "{e:#}");
        }
        summary.processed.push(package.clone());

        let built = count_dirs(&layout.success);
        let seen = summary.processed.len();
        info!(
            "{built}/{seen} ({:.1}%) packages could be (partially) built",
            built as f64 / seen as f64 * 100.0
        );
    }

    info!(
        processed = summary.processed.len(),
        skipped = summary.skipped,
        built = summary.built,
        interrupted = summary.interrupted,
        "worker finished"
    );
    Ok(summary)
}

fn count_dirs(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .count()
        })
        .unwrap_or(0)
}

/// Run the pipeline for a package whose claim directory is `dir`.
pub fn process_package(
    package: &str,
    dir: &Path,
    layout: &OutputLayout,
    config: &WorkerConfig,
    cancel: &AtomicBool,
) -> Result<PackageOutcome, PackageError> {
    let tc = &config.toolchain;
    let src_parent = dir.join("src");
    fs::create_dir(&src_parent)?;

    info!(package, "fetching sources");
    let package_arg = [OsString::from(package)];
    Step {
        name: "apt-get-source",
        command: &tc.fetch,
        extra_args: &package_arg,
        cwd: &src_parent,
        logs_dir: dir,
        env: &[],
        timeout: None,
    }
    .run(cancel)?;

    let src_dir = single_source_dir(&src_parent)?;
    info!(dir = %src_dir.display(), "unpacked and patched sources");
    // keep only the extracted sources, drop the downloaded archives
    for entry in fs::read_dir(&src_parent)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }

    if !scan::has_c_sources(&src_dir) {
        return Err(PackageError::NoCSources);
    }

    check_cancel(cancel)?;
    let configure_dir = run_configure(&src_dir, dir, tc, cancel)?;
    check_cancel(cancel)?;
    let cmake_dir = run_cmake(&src_dir, dir, tc, cancel)?;
    check_cancel(cancel)?;

    // Anything older than this cannot be a product of our build. Taken from a
    // file stamped by the filesystem, whose clock lags SystemTime::now().
    let make_started = fs_now(dir)?;
    if let Some(d) = configure_dir.as_deref().filter(|d| *d != src_dir.as_path()) {
        run_make(d, "configure", dir, tc, cancel)?;
    }
    if let Some(d) = cmake_dir.as_deref().filter(|d| *d != src_dir.as_path()) {
        run_make(d, "cmake", dir, tc, cancel)?;
    }
    run_make(&src_dir, "toplevel", dir, tc, cancel)?;
    check_cancel(cancel)?;

    let wasm_files = scan::wasm_files_since(&src_dir, make_started);
    if wasm_files.is_empty() {
        info!(package, "no wasm binaries produced");
        return Ok(PackageOutcome::default());
    }
    info!(package, count = wasm_files.len(), "found wasm binaries");
    harvest(package, dir, &wasm_files, layout)
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), PackageError> {
    if cancel.load(Ordering::SeqCst) {
        return Err(PackageError::Interrupted);
    }
    Ok(())
}

fn fs_now(dir: &Path) -> Result<SystemTime, PackageError> {
    let stamp = dir.join(".make-started");
    fs::write(&stamp, b"")?;
    let now = fs::metadata(&stamp)?.modified()?;
    fs::remove_file(&stamp)?;
    Ok(now)
}

fn single_source_dir(src_parent: &Path) -> Result<PathBuf, PackageError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(src_parent)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    debug!(?dirs, "extracted directories");
    match dirs.len() {
        0 => Err(PackageError::NoSourceDir),
        1 => Ok(dirs.remove(0)),
        _ => Err(PackageError::MultipleSourceDirs(dirs)),
    }
}

/// Pick the topmost file named `filename`, warning when there are several.
fn topmost(src_dir: &Path, filename: &str) -> Option<PathBuf> {
    let found = scan::find_by_filename_bfs(src_dir, filename);
    debug!(?found, "{filename} files");
    let first = found.first()?.clone();
    if found.len() > 1 {
        warn!(file = %first.display(), "more than one {filename} found, taking topmost");
    }
    first.parent().map(Path::to_path_buf)
}

fn run_configure(
    src_dir: &Path,
    logs_dir: &Path,
    tc: &Toolchain,
    cancel: &AtomicBool,
) -> Result<Option<PathBuf>, PackageError> {
    let Some(configure_dir) = topmost(src_dir, "configure") else {
        info!("no configure script found, trying to build without");
        return Ok(None);
    };
    info!(dir = %configure_dir.display(), "running configure");
    let outcome = Step {
        name: "emconfigure",
        command: &tc.configure,
        extra_args: &[],
        cwd: &configure_dir,
        logs_dir,
        env: &[],
        timeout: tc.configure_timeout,
    }
    .run(cancel)?;

    if let StepOutcome::TimedOut(limit) = outcome {
        error!(
            "configure: killed after {} seconds, maybe hung in a sleep/nanosleep check?",
            limit.as_secs()
        );
    }
    if let Some(stderr) = outcome.stderr() {
        let diag = scan::diagnose_configure(stderr);
        for lib in &diag.missing_libraries {
            error!("configure: missing library {lib}");
        }
        for pkg in &diag.missing_packages {
            error!("configure: missing package {pkg}");
        }
    }
    Ok(Some(configure_dir))
}

fn run_cmake(
    src_dir: &Path,
    logs_dir: &Path,
    tc: &Toolchain,
    cancel: &AtomicBool,
) -> Result<Option<PathBuf>, PackageError> {
    let Some(cmake_dir) = topmost(src_dir, "CMakeLists.txt") else {
        info!("no CMakeLists.txt found, trying to build without CMake");
        return Ok(None);
    };
    info!(dir = %cmake_dir.display(), "running cmake");
    let outcome = Step {
        name: "emcmake",
        command: &tc.cmake,
        extra_args: &[],
        cwd: &cmake_dir,
        logs_dir,
        env: &[],
        timeout: tc.cmake_timeout,
    }
    .run(cancel)?;
    if let StepOutcome::TimedOut(limit) = outcome {
        error!("cmake: killed after {} seconds", limit.as_secs());
    }
    Ok(Some(cmake_dir))
}

fn run_make(
    make_dir: &Path,
    which: &str,
    logs_dir: &Path,
    tc: &Toolchain,
    cancel: &AtomicBool,
) -> Result<(), PackageError> {
    info!(dir = %make_dir.display(), "running make");
    let name = format!("emmake-{which}-dir");
    let outcome = Step {
        name: &name,
        command: &tc.make,
        extra_args: &[],
        cwd: make_dir,
        logs_dir,
        env: &tc.make_env,
        timeout: tc.make_timeout,
    }
    .run(cancel)?;
    match &outcome {
        StepOutcome::TimedOut(limit) => {
            error!("make: killed after {} seconds", limit.as_secs());
        }
        StepOutcome::Exited { .. } => {
            if outcome.stderr().is_some_and(scan::make_found_no_makefile) {
                error!("make: no makefile found");
            }
        }
    }
    Ok(())
}

/// Copy binaries into `wasm/` (and `wasm-dwarf/`), move sources and step
/// logs into `success/<package>`.
fn harvest(
    package: &str,
    dir: &Path,
    wasm_files: &[PathBuf],
    layout: &OutputLayout,
) -> Result<PackageOutcome, PackageError> {
    let success_dir = layout.success.join(package);
    if success_dir.exists() {
        warn!(dir = %success_dir.display(), "already exists, removing");
        fs::remove_dir_all(&success_dir)?;
    }
    fs::create_dir(&success_dir)?;

    let mut outcome = PackageOutcome::default();
    for file in wasm_files {
        let size = fs::metadata(file)?.len();
        let dwarf = scan::contains_dwarf(file)?;
        info!(
            file = %file.display(),
            size = %format_size(size, BINARY),
            dwarf,
            "wasm binary"
        );

        // keep the directory structure below all/, e.g. wasm/<package>/src/...
        let relative_parent = file
            .strip_prefix(&layout.all)
            .ok()
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new(package));
        let Some(file_name) = file.file_name() else {
            continue;
        };
        let mut targets = vec![&layout.wasm];
        if dwarf {
            targets.push(&layout.wasm_dwarf);
        }
        for root in targets {
            let dst_dir = root.join(relative_parent);
            fs::create_dir_all(&dst_dir)?;
            fs::copy(file, dst_dir.join(file_name))?;
        }

        outcome.wasm_files += 1;
        if dwarf {
            outcome.with_dwarf += 1;
        }
    }

    info!(from = %dir.display(), to = %success_dir.display(), "copying step logs");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), success_dir.join(entry.file_name()))?;
        }
    }
    // a rename keeps self-referential symlinks inside the tree intact
    fs::rename(dir.join("src"), success_dir.join("src"))?;

    Ok(outcome)
}
