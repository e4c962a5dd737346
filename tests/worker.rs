//! Worker pipeline tests with a fake toolchain.
//!
//! `sh` scripts stand in for `apt-get source` and `emmake make`: the fetch
//! script unpacks a directory with a C file, the make script writes a Wasm
//! binary (with or without a `.debug_info` section, by package name).
#![cfg(target_os = "linux")]

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tempfile::tempdir;
use wasm_farm::config::{ReportConfig, Toolchain, WorkerConfig};
use wasm_farm::packages::Selection;
use wasm_farm::process::CommandSpec;
use wasm_farm::report;
use wasm_farm::worker::run_worker;

const FETCH: &str = r#"
case "$1" in
  nosrc-*) mkdir "$1-1.0" && echo docs > "$1-1.0/README" ;;
  *) mkdir "$1-1.0" && echo 'int main(void) { return 0; }' > "$1-1.0/main.c" ;;
esac
touch "$1_1.0.orig.tar.gz"
"#;

const MAKE: &str = r#"
case "$PWD" in
  *plain-*) printf '\0asm\001\0\0\0' > out.wasm ;;
  *) printf '\0asm\001\0\0\0\0\014\013.debug_info' > out.wasm ;;
esac
"#;

fn fake_toolchain(dir: &Path) -> Toolchain {
    let fetch = dir.join("fetch.sh");
    let make = dir.join("make.sh");
    fs::write(&fetch, FETCH).expect("write fetch.sh");
    fs::write(&make, MAKE).expect("write make.sh");
    Toolchain {
        fetch: CommandSpec::parse(&format!("sh {}", fetch.display()), "fetch").unwrap(),
        make: CommandSpec::parse(&format!("sh {}", make.display()), "make").unwrap(),
        configure_timeout: None,
        cmake_timeout: None,
        make_timeout: None,
        ..Toolchain::default()
    }
}

fn package_names() -> Vec<String> {
    (0..5)
        .map(|i| format!("with-dwarf-{i}"))
        .chain((0..3).map(|i| format!("plain-{i}")))
        .chain((0..2).map(|i| format!("nosrc-{i}")))
        .collect()
}

fn worker_config(root: &Path, seed: u64) -> WorkerConfig {
    let list = root.join("packages.list");
    if !list.exists() {
        fs::write(&list, package_names().join("\n") + "\n").expect("write list");
    }
    WorkerConfig {
        package_list: list,
        output_dir: root.join("output"),
        selection: Selection {
            shuffle: true,
            seed: Some(seed),
            ..Default::default()
        },
        keep_src: false,
        toolchain: fake_toolchain(root),
    }
}

#[test]
fn single_worker_builds_and_sorts_binaries() {
    let tmp = tempdir().expect("tempdir");
    let config = worker_config(tmp.path(), 1);
    let summary = run_worker(&config, &AtomicBool::new(false)).expect("worker failed");

    assert_eq!(summary.processed.len(), 10);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.built, 8);
    assert!(!summary.interrupted);

    let out = tmp.path().join("output");
    assert!(
        out.join("wasm/with-dwarf-0/src/with-dwarf-0-1.0/out.wasm")
            .is_file()
    );
    assert!(
        out.join("wasm-dwarf/with-dwarf-0/src/with-dwarf-0-1.0/out.wasm")
            .is_file()
    );
    assert!(out.join("wasm/plain-1/src/plain-1-1.0/out.wasm").is_file());
    assert!(!out.join("wasm-dwarf/plain-1").exists());

    // sources and step logs moved to success/, archives dropped
    let success = out.join("success/with-dwarf-2");
    assert!(success.join("src/with-dwarf-2-1.0/main.c").is_file());
    assert!(success.join("apt-get-source.stdout").is_file());
    assert!(success.join("emmake-toplevel-dir.stderr").is_file());
    assert!(!success.join("src/with-dwarf-2_1.0.orig.tar.gz").exists());

    // failed packages keep their logs only
    let nosrc = out.join("all/nosrc-0");
    assert!(nosrc.join("apt-get-source.stdout").is_file());
    assert!(!nosrc.join("src").exists());
    assert!(!out.join("success/nosrc-0").exists());
}

#[test]
fn rerun_skips_claimed_packages() {
    let tmp = tempdir().expect("tempdir");
    let config = worker_config(tmp.path(), 3);
    run_worker(&config, &AtomicBool::new(false)).expect("first run");
    let again = run_worker(&config, &AtomicBool::new(false)).expect("second run");

    assert!(again.processed.is_empty());
    assert_eq!(again.skipped, 10);
}

#[test]
fn concurrent_workers_cover_the_list_once() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    // write the list and scripts once, before the threads race
    let base = worker_config(root, 0);

    let handles: Vec<_> = (0..3u64)
        .map(|seed| {
            let mut config = base.clone();
            config.selection.seed = Some(seed);
            thread::spawn(move || {
                run_worker(&config, &AtomicBool::new(false)).expect("worker failed")
            })
        })
        .collect();
    let summaries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut seen = HashSet::new();
    for summary in &summaries {
        for package in &summary.processed {
            assert!(seen.insert(package.clone()), "{package} processed twice");
        }
    }
    let expected: HashSet<String> = package_names().into_iter().collect();
    assert_eq!(seen, expected);

    let report = report::compute(
        &ReportConfig {
            output_dir: root.join("output"),
            package_list: Some(root.join("packages.list")),
            log_pattern: None,
            stale_after: Duration::from_secs(60),
        },
        SystemTime::now(),
    )
    .expect("report");
    let counts = report.counts;
    assert_eq!(counts.total_packages, Some(10));
    assert_eq!(counts.attempted, 10);
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.built, 8);
    assert_eq!(counts.with_debug_info, 5);
    assert_eq!(counts.wasm_files["wasm"].files, 8);
    assert_eq!(counts.wasm_dwarf_files["wasm"].files, 5);
}

#[test]
fn cancelled_worker_processes_nothing() {
    let tmp = tempdir().expect("tempdir");
    let config = worker_config(tmp.path(), 5);
    let summary = run_worker(&config, &AtomicBool::new(true)).expect("worker failed");

    assert!(summary.interrupted);
    assert!(summary.processed.is_empty());
    let claimed = fs::read_dir(tmp.path().join("output/all"))
        .unwrap()
        .count();
    assert_eq!(claimed, 0);
}

#[test]
fn bad_list_entry_is_skipped() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::write(root.join("packages.list"), "alpha\nbad/name\nzeta\n").unwrap();
    let mut config = worker_config(root, 0);
    config.selection = Selection::default();

    let summary = run_worker(&config, &AtomicBool::new(false)).expect("worker failed");
    assert_eq!(summary.processed, ["alpha", "zeta"]);
    assert!(root.join("output/all/zeta/.done").is_file());
    assert!(!root.join("output/all/bad").exists());
}

#[test]
fn cancelling_a_build_releases_the_claim() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::write(root.join("packages.list"), "alpha\nbeta\n").unwrap();
    let mut config = worker_config(root, 0);
    let started = root.join("make-started");
    let make = root.join("slow-make.sh");
    fs::write(&make, format!("touch {}\nsleep 30\n", started.display())).unwrap();
    config.toolchain.make = CommandSpec::parse(&format!("sh {}", make.display()), "make").unwrap();

    let cancel = AtomicBool::new(false);
    let summary = thread::scope(|s| {
        s.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(30);
            while !started.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            cancel.store(true, Ordering::SeqCst);
        });
        run_worker(&config, &cancel).expect("worker failed")
    });

    assert!(summary.interrupted);
    assert!(summary.processed.is_empty());
    let claims = fs::read_dir(root.join("output/all")).unwrap().count();
    assert_eq!(claims, 0, "interrupted package must stay unclaimed");
}
