//! CLI integration tests for wasm-farm.
//!
//! These run the compiled binary end-to-end. None of them needs apt or
//! emscripten: `work` gets fake fetch/make commands, the rest only reads
//! the output tree or the process table.
use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_wasm-farm"))
}

#[test]
fn report_json_counts_attempts() {
    let tmp = tempdir().expect("tempdir");
    let out = tmp.path().join("output");
    for name in ["a", "b"] {
        fs::create_dir_all(out.join("all").join(name)).unwrap();
    }
    fs::create_dir_all(out.join("success/a")).unwrap();
    let list = tmp.path().join("packages.list");
    fs::write(&list, "a\nb\nc\nd\n").unwrap();

    let output = bin()
        .args(["report", "--json", "-o"])
        .arg(&out)
        .arg("--package-list")
        .arg(&list)
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(output.status.success(), "report command failed");

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(json["counts"]["total_packages"], 4);
    assert_eq!(json["counts"]["attempted"], 2);
    assert_eq!(json["counts"]["attempted_percent"], 50.0);
    assert_eq!(json["counts"]["built"], 1);
    assert_eq!(json["counts"]["in_progress"], 2);
    assert!(json["workers"].as_array().is_some_and(|w| w.is_empty()));
}

#[test]
fn report_text_shows_percentages() {
    let tmp = tempdir().expect("tempdir");
    let out = tmp.path().join("output");
    for i in 0..8 {
        fs::create_dir_all(out.join(format!("all/p{i}"))).unwrap();
    }
    let list = tmp.path().join("packages.list");
    let names: String = (0..10).map(|i| format!("p{i}\n")).collect();
    fs::write(&list, names).unwrap();

    let output = bin()
        .arg("report")
        .arg("-o")
        .arg(&out)
        .arg("--package-list")
        .arg(&list)
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("attempted:       8/10 (80.0%)"), "{stdout}");
}

#[test]
fn supervise_rejects_zero_workers() {
    let tmp = tempdir().expect("tempdir");
    let list = tmp.path().join("packages.list");
    fs::write(&list, "a\n").unwrap();

    let output = bin()
        .args(["supervise", "--workers", "0", "--package-list"])
        .arg(&list)
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("at least 1"), "{stderr}");
}

#[test]
fn supervise_rejects_pattern_without_placeholder() {
    let output = bin()
        .args(["supervise", "--log-pattern", "logs/worker.log"])
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(!output.status.success());
}

#[test]
fn kill_step_needs_a_worker_and_a_target() {
    let output = bin()
        .arg("kill-step")
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(!output.status.success());

    let output = bin()
        .args(["kill-step", "--worker", "1"])
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(!output.status.success());
}

#[test]
fn work_rejects_bad_range() {
    let output = bin()
        .args(["work", "--range", "5..2"])
        .output()
        .expect("failed to spawn wasm-farm binary");
    assert!(!output.status.success());
}

#[cfg(target_os = "linux")]
#[test]
fn work_with_fake_toolchain_writes_logfile() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::write(root.join("packages.list"), "hello\n").unwrap();
    fs::write(
        root.join("fetch.sh"),
        r#"mkdir "$1-1.0" && echo 'int main(void) { return 0; }' > "$1-1.0/hello.c""#,
    )
    .unwrap();
    fs::write(root.join("make.sh"), r"printf '\0asm\001\0\0\0' > hello.wasm").unwrap();

    let log = root.join("worker.log");
    let status = bin()
        .current_dir(root)
        .args(["work", "--no-default-excludes", "--logfile"])
        .arg(&log)
        .arg("--fetch-cmd")
        .arg(format!("sh {}", root.join("fetch.sh").display()))
        .arg("--make-cmd")
        .arg(format!("sh {}", root.join("make.sh").display()))
        .status()
        .expect("failed to spawn wasm-farm binary");
    assert!(status.success(), "work command failed");

    assert!(root.join("output/all/hello/.done").is_file());
    assert!(
        root.join("output/wasm/hello/src/hello-1.0/hello.wasm")
            .is_file()
    );
    assert!(!root.join("output/wasm-dwarf/hello").exists());
    let text = fs::read_to_string(&log).expect("worker log");
    assert!(text.contains("package hello"), "{text}");
    assert!(text.contains("found wasm binaries"), "{text}");
}
