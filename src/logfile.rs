//! Append-only worker log that survives external truncation and rotation.
//!
//! Operators truncate or move runaway logs while workers keep running. The
//! file is opened with `O_APPEND`, so after a truncation the next write lands
//! at the new end instead of leaving a hole. Before each write the path is
//! checked against the open handle; if it now names a different file (or
//! nothing) the log is reopened at the path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Debug)]
struct Inner {
    file: File,
    dev: u64,
    ino: u64,
}

#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn open_append(path: &Path) -> io::Result<Inner> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let meta = file.metadata()?;
    Ok(Inner {
        file,
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

impl LogFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let inner = open_append(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reopen_if_replaced(&self, inner: &mut Inner) -> io::Result<()> {
        let replaced = match fs::metadata(&self.path) {
            Ok(meta) => meta.dev() != inner.dev || meta.ino() != inner.ino,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };
        if replaced {
            *inner = open_append(&self.path)?;
        }
        Ok(())
    }
}

impl Write for &LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.reopen_if_replaced(&mut inner)?;
        inner.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.file.flush()
    }
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: stderr, plus the log file when given.
///
/// `RUST_LOG` overrides the verbosity-derived level.
pub fn init_tracing(verbosity: u8, logfile: Option<Arc<LogFile>>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));
    let stderr = fmt::layer().with_writer(io::stderr);
    let file = logfile.map(|log| fmt::layer().with_ansi(false).with_writer(log));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();
}
