//! The package list and how one worker selects and orders its view of it.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::StdRng};
use regex::Regex;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Packages that never contain code worth compiling.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "linux.*((headers)|(modules)|(image)|(tools)|(buildinfo)).*",
    // Firefox and Thunderbird ship every locale as a separate, large package.
    "((firefox)|(thunderbird)).*locale.*",
    ".*fonts.*",
];

/// Seed used for `--random-sample`, so the same list always yields the same sample.
const SAMPLE_SEED: u64 = 0;

/// Parse a half-open `START..END` range with `START < END`.
pub fn parse_range(arg: &str) -> Result<(usize, usize), ConfigError> {
    let (start, end) = arg
        .split_once("..")
        .ok_or_else(|| ConfigError::InvalidRange(arg.to_string()))?;
    let parse = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidRange(arg.to_string()));
        }
        s.parse::<usize>()
            .map_err(|_| ConfigError::InvalidRange(arg.to_string()))
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start >= end {
        return Err(ConfigError::EmptyRange { start, end });
    }
    Ok((start, end))
}

/// Compile exclusion patterns, anchoring each one to the full package name.
pub fn compile_excludes<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            let p = p.as_ref();
            Regex::new(&format!("^(?:{p})$")).map_err(|e| ConfigError::ExcludePattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Read a newline-delimited package list. Blank lines are ignored.
pub fn read_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read package list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Load the package list, generating it with `generate` if the file does not exist yet.
///
/// The generated list is written to a temp file next to `path` and renamed into
/// place, so workers starting concurrently never observe a partial list.
pub fn load_or_generate<F>(path: &Path, generate: F) -> Result<Vec<String>>
where
    F: FnOnce() -> Result<Vec<String>>,
{
    if path.exists() {
        info!(path = %path.display(), "loading package list");
        return read_list(path);
    }

    info!(path = %path.display(), "package list does not exist, generating");
    let packages = generate()?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    for p in &packages {
        writeln!(tmp, "{p}").context("failed to write package list")?;
    }
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(packages),
        // another worker won the race; keep whichever list landed first
        Err(_) if path.exists() => read_list(path),
        Err(e) => Err(anyhow!(
            "failed to persist package list {}: {}",
            path.display(),
            e.error
        )),
    }
}

/// All package names known to apt, sorted.
pub fn apt_package_names() -> Result<Vec<String>> {
    let output = Command::new("apt-cache")
        .arg("pkgnames")
        .output()
        .context("failed to run apt-cache; pass an existing --package-list instead")?;
    if !output.status.success() {
        return Err(anyhow!("apt-cache pkgnames failed with status {}", output.status));
    }
    let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    Ok(names)
}

/// How a worker narrows and orders the package list.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub excludes: Vec<Regex>,
    pub range: Option<(usize, usize)>,
    pub random_sample: Option<usize>,
    pub shuffle: bool,
    /// Shuffle seed; `None` uses OS randomness.
    pub seed: Option<u64>,
}

impl Selection {
    /// Apply exclusion, range, sampling and shuffling, in that order.
    pub fn apply(&self, mut packages: Vec<String>) -> Vec<String> {
        for re in &self.excludes {
            packages.retain(|p| !re.is_match(p));
            info!(
                remaining = packages.len(),
                pattern = re.as_str(),
                "filtered package list"
            );
        }

        if let Some((start, end)) = self.range {
            let end = end.min(packages.len());
            let start = start.min(end);
            packages = packages[start..end].to_vec();
            info!(
                count = packages.len(),
                start, end, "selected packages from range (end exclusive)"
            );
        }

        let mut sampled = false;
        if let Some(n) = self.random_sample {
            if n < packages.len() {
                packages.shuffle(&mut StdRng::seed_from_u64(SAMPLE_SEED));
                packages.truncate(n);
                // random subset, alphabetical processing order
                packages.sort();
                sampled = true;
                info!(count = packages.len(), "selected random subset of packages");
            } else {
                info!("--random-sample ignored, package list already has fewer than N packages");
            }
        }

        if self.shuffle {
            if sampled {
                info!("--shuffle ignored because --random-sample already selects a random subset");
            } else {
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                packages.shuffle(&mut rng);
                info!(seed = ?self.seed, "shuffled package list");
            }
        }

        debug!(?packages, "final package order");
        packages
    }
}
