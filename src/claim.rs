//! Per-package claims on the shared output tree.
//!
//! Workers do not coordinate beyond the filesystem. A package belongs to
//! whichever worker first creates `all/<package>`; `create_dir` is atomic,
//! so two workers starting at the same moment cannot both win. A package
//! can still be attempted twice across runs if a claim is released after
//! an interruption, which keeps scheduling at-least-once.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Written into a claim directory once its package has been fully processed.
pub const DONE_MARKER: &str = ".done";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This worker owns the package; the directory was just created.
    Acquired(PathBuf),
    /// The directory already exists (another worker or an earlier run).
    Taken,
}

/// Atomically claim `package` below `all_dir`.
pub fn claim(all_dir: &Path, package: &str) -> Result<Claim> {
    if package.is_empty() || package.contains('/') || package == "." || package == ".." {
        return Err(anyhow!("invalid package name '{package}'"));
    }
    let dir = all_dir.join(package);
    match fs::create_dir(&dir) {
        Ok(()) => Ok(Claim::Acquired(dir)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Claim::Taken),
        Err(e) => Err(e).with_context(|| format!("failed to create {}", dir.display())),
    }
}

/// Remove a claim so the package is retried by the next run.
pub fn release(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir).with_context(|| format!("failed to release claim {}", dir.display()))
}

pub fn mark_done(dir: &Path) -> Result<()> {
    fs::write(dir.join(DONE_MARKER), b"")
        .with_context(|| format!("failed to mark {} as done", dir.display()))
}

pub fn is_done(dir: &Path) -> bool {
    dir.join(DONE_MARKER).is_file()
}
