//! External build steps, each in its own process group.
//!
//! Killing only the direct child leaves `make` and compiler grandchildren
//! running, so every step becomes the leader of a fresh group and timeouts
//! or cancellation signal the whole group.

use std::ffi::OsString;
use std::fs::{self, File};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ConfigError, PackageError};

/// Shared cancellation flag, raised by the signal handler.
pub type CancelFlag = Arc<AtomicBool>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A program plus fixed leading arguments, e.g. `emmake make`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    /// Split a whitespace-separated command line such as `"emcmake cmake ."`.
    pub fn parse(line: &str, what: &'static str) -> Result<Self, ConfigError> {
        let mut parts = line.split_whitespace().map(OsString::from);
        let program = parts.next().ok_or(ConfigError::EmptyCommand(what))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One invocation of an external tool.
#[derive(Debug, Clone)]
pub struct Step<'a> {
    /// Base name of the `.stdout` / `.stderr` files.
    pub name: &'a str,
    pub command: &'a CommandSpec,
    pub extra_args: &'a [OsString],
    pub cwd: &'a Path,
    pub logs_dir: &'a Path,
    pub env: &'a [(String, String)],
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum StepOutcome {
    Exited {
        status: ExitStatus,
        /// Captured stderr, only read back for unsuccessful runs.
        stderr: Option<String>,
    },
    TimedOut(Duration),
}

impl StepOutcome {
    pub fn stderr(&self) -> Option<&str> {
        match self {
            StepOutcome::Exited { stderr, .. } => stderr.as_deref(),
            StepOutcome::TimedOut(_) => None,
        }
    }
}

impl Step<'_> {
    fn log_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.logs_dir.join(format!("{}.stdout", self.name)),
            self.logs_dir.join(format!("{}.stderr", self.name)),
        )
    }

    /// Run the step to completion, its timeout, or cancellation.
    ///
    /// Cancellation kills the process group and returns `PackageError::Interrupted`.
    pub fn run(&self, cancel: &AtomicBool) -> Result<StepOutcome, PackageError> {
        let (stdout_path, stderr_path) = self.log_paths();
        let stdout = File::create(&stdout_path)?;
        let stderr = File::create(&stderr_path)?;
        let shown = format!(
            "{}{}",
            self.command.display(),
            self.extra_args
                .iter()
                .map(|a| format!(" {}", a.to_string_lossy()))
                .collect::<String>()
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .args(self.extra_args)
            .current_dir(self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| PackageError::Spawn {
                command: shown.clone(),
                source,
            })?;
        let pgid = Pid::from_raw(child.id() as i32);
        debug!(command = %shown, pid = child.id(), cwd = %self.cwd.display(), "spawned step");

        let started = Instant::now();
        let status = loop {
            let exited = match child.try_wait() {
                Ok(exited) => exited,
                Err(e) => {
                    kill_group(pgid, Signal::SIGKILL);
                    let _ = child.wait();
                    return Err(e.into());
                }
            };
            if cancel.load(Ordering::SeqCst) {
                kill_group(pgid, Signal::SIGKILL);
                if exited.is_none() {
                    let _ = child.wait();
                }
                return Err(PackageError::Interrupted);
            }
            if let Some(status) = exited {
                break status;
            }
            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                kill_group(pgid, Signal::SIGKILL);
                let _ = child.wait();
                warn!(command = %shown, seconds = limit.as_secs(), "killed step after timeout");
                return Ok(StepOutcome::TimedOut(limit));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // The leader exited but helpers it left behind in its group would otherwise
        // keep running unattended.
        kill_group(pgid, Signal::SIGKILL);

        // A supervisor cancelling the run signals our step and us at once; the
        // step can be gone before our own handler has raised the flag.
        if status.signal().is_some() {
            thread::sleep(POLL_INTERVAL);
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(PackageError::Interrupted);
        }

        let stderr = if status.success() {
            None
        } else {
            warn!(
                command = %shown,
                code = ?status.code(),
                logs = %self.logs_dir.display(),
                "non-zero return code"
            );
            Some(String::from_utf8_lossy(&fs::read(&stderr_path)?).into_owned())
        };
        Ok(StepOutcome::Exited { status, stderr })
    }
}

/// Signal a process group, ignoring groups that no longer exist.
///
/// Returns whether the group still existed.
pub fn kill_group(pgid: Pid, signal: Signal) -> bool {
    match killpg(pgid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid = pgid.as_raw(), ?signal, err = %e, "failed to signal process group");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn parse_splits_program_and_args() {
        let spec = CommandSpec::parse("emcmake cmake .", "cmake").unwrap();
        assert_eq!(spec.program, OsString::from("emcmake"));
        assert_eq!(spec.args, vec![OsString::from("cmake"), OsString::from(".")]);
        assert_eq!(spec.display(), "emcmake cmake .");
        assert_eq!(
            CommandSpec::parse("   ", "make"),
            Err(ConfigError::EmptyCommand("make"))
        );
    }

    #[test]
    fn captures_output_and_stderr_on_failure() {
        let tmp = tempdir().expect("tempdir");
        let cmd = sh("echo out; echo 'required library foo not found' >&2; exit 3");
        let step = Step {
            name: "emconfigure",
            command: &cmd,
            extra_args: &[],
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &[],
            timeout: None,
        };
        let outcome = step.run(&AtomicBool::new(false)).unwrap();
        match &outcome {
            StepOutcome::Exited { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.as_deref().unwrap().contains("foo"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            fs::read_to_string(tmp.path().join("emconfigure.stdout")).unwrap(),
            "out\n"
        );
    }

    #[test]
    fn passes_env_and_extra_args() {
        let tmp = tempdir().expect("tempdir");
        let cmd = sh("echo \"$EMMAKEN_CFLAGS $0\"");
        let extra = [OsString::from("zlib")];
        let env = [("EMMAKEN_CFLAGS".to_string(), "-g".to_string())];
        let step = Step {
            name: "emmake",
            command: &cmd,
            extra_args: &extra,
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &env,
            timeout: None,
        };
        let outcome = step.run(&AtomicBool::new(false)).unwrap();
        assert!(matches!(outcome, StepOutcome::Exited { ref status, .. } if status.success()));
        assert_eq!(
            fs::read_to_string(tmp.path().join("emmake.stdout")).unwrap(),
            "-g zlib\n"
        );
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let tmp = tempdir().expect("tempdir");
        let marker = tmp.path().join("survived");
        let script = format!("(sleep 2; touch '{}') & sleep 30", marker.display());
        let cmd = sh(&script);
        let step = Step {
            name: "emmake",
            command: &cmd,
            extra_args: &[],
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &[],
            timeout: Some(Duration::from_millis(300)),
        };
        let outcome = step.run(&AtomicBool::new(false)).unwrap();
        assert!(matches!(outcome, StepOutcome::TimedOut(_)));

        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "background grandchild outlived the timeout");
    }

    #[test]
    fn step_killed_during_cancellation_is_interrupted() {
        let tmp = tempdir().expect("tempdir");
        let cmd = sh("kill -TERM $$");
        let step = Step {
            name: "emmake",
            command: &cmd,
            extra_args: &[],
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &[],
            timeout: None,
        };
        let cancel = AtomicBool::new(false);
        let err = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                cancel.store(true, Ordering::SeqCst);
            });
            step.run(&cancel).unwrap_err()
        });
        assert!(err.is_interrupted());
    }

    #[test]
    fn killed_step_without_cancellation_is_a_failure() {
        let tmp = tempdir().expect("tempdir");
        let cmd = sh("kill -KILL $$");
        let step = Step {
            name: "emmake",
            command: &cmd,
            extra_args: &[],
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &[],
            timeout: None,
        };
        match step.run(&AtomicBool::new(false)).unwrap() {
            StepOutcome::Exited { status, stderr } => {
                assert_eq!(status.signal(), Some(9));
                assert_eq!(stderr.as_deref(), Some(""));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn cancellation_interrupts_step() {
        let tmp = tempdir().expect("tempdir");
        let cmd = sh("sleep 30");
        let step = Step {
            name: "apt-get-source",
            command: &cmd,
            extra_args: &[],
            cwd: tmp.path(),
            logs_dir: tmp.path(),
            env: &[],
            timeout: None,
        };
        let err = step.run(&AtomicBool::new(true)).unwrap_err();
        assert!(err.is_interrupted());
    }
}
