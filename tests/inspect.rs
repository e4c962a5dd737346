//! Operator tooling against a live worker: find it through its log, stop
//! one build step, and check the worker carries on with the next package.
#![cfg(target_os = "linux")]

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tempfile::tempdir;
use wasm_farm::inspect::{self, KillOutcome, ProcessTable};

/// Pairs of `<step shell pid> <sleep pid>` recorded by the fake make.
fn recorded_steps(pids: &Path) -> Vec<(u32, u32)> {
    fs::read_to_string(pids)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| {
            let (a, b) = l.split_once(' ')?;
            Some((a.parse().ok()?, b.parse().ok()?))
        })
        .collect()
}

fn wait_for_steps(pids: &Path, n: usize) -> Vec<(u32, u32)> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let steps = recorded_steps(pids);
        if steps.len() >= n || Instant::now() > deadline {
            return steps;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn is_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

fn wait_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !is_gone(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    is_gone(pid)
}

#[test]
fn kill_step_stops_the_step_and_spares_the_worker() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    let pids = root.join("pids");
    fs::write(root.join("packages.list"), "alpha\nbeta\n").unwrap();
    fs::write(
        root.join("fetch.sh"),
        r#"mkdir "$1-1.0" && echo 'int main(void) { return 0; }' > "$1-1.0/main.c""#,
    )
    .unwrap();
    fs::write(
        root.join("make.sh"),
        format!("sleep 300 &\necho \"$$ $!\" >> {}\nwait\n", pids.display()),
    )
    .unwrap();

    let log = root.join("worker-0.log");
    let mut worker = Command::new(env!("CARGO_BIN_EXE_wasm-farm"))
        .current_dir(root)
        .args(["work", "--no-default-excludes", "--logfile"])
        .arg(&log)
        .arg("--fetch-cmd")
        .arg(format!("sh {}", root.join("fetch.sh").display()))
        .arg("--make-cmd")
        .arg(format!("sh {}", root.join("make.sh").display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .expect("failed to spawn wasm-farm binary");
    let worker_pid = worker.id();

    for (round, package) in ["alpha", "beta"].into_iter().enumerate() {
        let steps = wait_for_steps(&pids, round + 1);
        assert_eq!(steps.len(), round + 1, "make for {package} never started");
        let (step_shell, sleeper) = steps[round];

        // an operator tailing the log is not mistaken for the worker
        let _tail = File::open(&log).unwrap();
        assert_eq!(inspect::log_writers(&log).unwrap(), vec![worker_pid]);

        let table = ProcessTable::snapshot();
        let matches = table.find_step(worker_pid, "make.sh");
        assert_eq!(matches.len(), 1, "{matches:?}");
        assert_eq!(matches[0].pid, step_shell);

        let outcome =
            inspect::kill_step_group(&table, worker_pid, step_shell, Signal::SIGKILL, false)
                .expect("kill step");
        assert_eq!(outcome, KillOutcome::Signalled { pgid: step_shell });
        assert!(wait_gone(step_shell), "step shell {step_shell} survived");
        assert!(wait_gone(sleeper), "sleep {sleeper} in the step group survived");
    }

    // the worker moved on to beta after alpha's step was killed, then finished
    let status = worker.wait().expect("wait for worker");
    assert!(status.success(), "worker exited with {status}");
    for package in ["alpha", "beta"] {
        assert!(root.join(format!("output/all/{package}/.done")).is_file());
    }
}
