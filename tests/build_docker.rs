//! Integration tests against a real engine.
//!
//! These require a running Docker daemon and are marked `#[ignore]`.
//! Run with: `cargo test -- --ignored`

use std::path::PathBuf;

use boxbuild::build::{BuildError, BuildRunner, Outcome, State};
use boxbuild::config::{Config, Strategy};
use boxbuild::docker::{CancelToken, CliEngine, Engine};

const IMAGE: &str = "busybox:1.36";

/// A project directory with a couple of source files.
fn setup_workdir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
    std::fs::write(dir.path().join("src/main.txt"), "main\n").unwrap();
    std::fs::write(dir.path().join("src/nested/lib.txt"), "lib\n").unwrap();
    dir
}

fn engine_for(cfg: &Config) -> CliEngine {
    CliEngine::new(&cfg.engine)
        .expect("valid engine command")
        .with_build_command(cfg.command.clone())
        .with_timeout(cfg.timeout())
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

#[test]
#[ignore]
fn copy_in_build_extracts_install_dir() {
    let dir = setup_workdir();
    let cfg = Config {
        image: IMAGE.into(),
        command: sh("mkdir -p /workspace/install && cp -r /workspace/src/. /workspace/install/"),
        strategy: Strategy::CopyIn,
        timeout: Some(120),
        ..Config::default()
    };
    let engine = engine_for(&cfg);

    let (outcome, report) = BuildRunner::new(&engine, &cfg, dir.path()).run_with_report();

    assert!(outcome.is_success(), "build failed: {:?}", outcome.error());
    assert_eq!(report.state, State::TornDown);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("build/nested/lib.txt")).unwrap(),
        "lib\n"
    );
    assert_eq!(report.artifacts, 2);
}

#[test]
#[ignore]
fn detached_build_is_waited_for() {
    let dir = setup_workdir();
    let cfg = Config {
        image: IMAGE.into(),
        command: sh("sleep 1; mkdir -p /out && echo done > /out/marker"),
        strategy: Strategy::Detached,
        artifact_path: "/out".into(),
        output_dir: PathBuf::from("artifacts"),
        ..Config::default()
    };
    let engine = engine_for(&cfg);

    let outcome = BuildRunner::new(&engine, &cfg, dir.path()).run();

    assert!(outcome.is_success(), "build failed: {:?}", outcome.error());
    assert!(dir.path().join("artifacts/marker").is_file());
}

#[test]
#[ignore]
fn non_zero_exit_is_reported_and_cleaned_up() {
    let dir = setup_workdir();
    let cfg = Config {
        image: IMAGE.into(),
        command: sh("echo failing; exit 7"),
        ..Config::default()
    };
    let engine = engine_for(&cfg);

    let (outcome, report) = BuildRunner::new(&engine, &cfg, dir.path()).run_with_report();

    assert!(matches!(
        outcome,
        Outcome::Failure(BuildError::BuildFailed { exit_code: 7 })
    ));
    assert_eq!(report.state, State::TornDown);

    // The container must be gone.
    let handle = boxbuild::docker::EnvironmentHandle::new(report.handle.unwrap());
    assert!(engine.remove(&handle).is_err());
}

#[test]
#[ignore]
fn missing_image_fails_provisioning() {
    let dir = setup_workdir();
    let cfg = Config {
        image: "boxbuild-test/does-not-exist:never".into(),
        ..Config::default()
    };
    let engine = engine_for(&cfg);

    let outcome = BuildRunner::new(&engine, &cfg, dir.path()).run();
    assert!(matches!(
        outcome,
        Outcome::Failure(BuildError::Provisioning { .. })
    ));
}

#[test]
#[ignore]
fn cancel_mid_build_tears_down() {
    let dir = setup_workdir();
    let cfg = Config {
        image: IMAGE.into(),
        command: sh("sleep 60"),
        ..Config::default()
    };
    let engine = engine_for(&cfg);
    let cancel = CancelToken::new();

    let trigger = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_secs(3));
        trigger.cancel();
    });

    let (outcome, report) = BuildRunner::new(&engine, &cfg, dir.path())
        .with_cancel(cancel)
        .run_with_report();

    assert!(matches!(outcome, Outcome::Failure(BuildError::Execution { .. })));
    assert_eq!(report.state, State::TornDown);
}
