//! Looking inside an unpacked source tree: where to run configure and make,
//! which outputs are Wasm, and what a failed configure was missing.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::{Regex, RegexBuilder};
use tracing::debug;
use walkdir::WalkDir;

/// Extensions emcc can compile (or that indicate compilable C/C++ code).
pub const C_SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "c++", "cc", "h", "h++", "hxx", "hpp"];

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const DWARF_SECTION: &[u8] = b".debug_info";

/// Linking can fail and outputs need not end in `.wasm`, so check the magic bytes.
pub fn is_wasm(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == WASM_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether the binary carries a DWARF `.debug_info` custom section.
pub fn contains_dwarf(path: &Path) -> io::Result<bool> {
    let bytes = fs::read(path)?;
    Ok(bytes
        .windows(DWARF_SECTION.len())
        .any(|w| w == DWARF_SECTION))
}

/// Files named `filename` below `root`, topmost first.
pub fn find_by_filename_bfs(root: &Path, filename: &str) -> Vec<PathBuf> {
    let mut found: Vec<(usize, PathBuf)> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == filename)
        .map(|e| (e.depth(), e.into_path()))
        .collect();
    // stable: equal depths keep the walk's name order
    found.sort_by_key(|(depth, _)| *depth);
    found.into_iter().map(|(_, p)| p).collect()
}

pub fn has_c_sources(root: &Path) -> bool {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| C_SOURCE_EXTENSIONS.contains(&x))
        })
}

/// Regular files below `root` modified at or after `since` that are Wasm binaries.
///
/// Symlinks are not followed, so self-referential source trees cannot loop.
pub fn wasm_files_since(root: &Path, since: SystemTime) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name().into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(err = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let fresh = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|mtime| mtime >= since);
        if fresh && is_wasm(entry.path()).unwrap_or(false) {
            out.push(entry.into_path());
        }
    }
    out
}

static MISSING_LIBRARY: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"required library (.*?) not found")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

static MISSING_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"no package (.*) found")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

/// Missing dependencies reported by a configure script, for quicker triage.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigureDiagnostics {
    pub missing_libraries: Vec<String>,
    pub missing_packages: Vec<String>,
}

pub fn diagnose_configure(stderr: &str) -> ConfigureDiagnostics {
    let collect = |re: &Regex| {
        re.captures_iter(stderr)
            .map(|c| c[1].to_string())
            .collect::<Vec<_>>()
    };
    ConfigureDiagnostics {
        missing_libraries: collect(&MISSING_LIBRARY),
        missing_packages: collect(&MISSING_PACKAGE),
    }
}

pub fn make_found_no_makefile(stderr: &str) -> bool {
    stderr.contains("no makefile found")
}
