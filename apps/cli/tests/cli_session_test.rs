//! End-to-end tests for the init/train/status commands on the toy backend.

use serde_json::json;
use tempfile::TempDir;
use trellis_cli::commands::init::InitOutcome;
use trellis_cli::commands::{init, status, train};
use trellis_training::testing::{toy_registry, toy_spec};

fn write_spec(temp: &TempDir) -> std::path::PathBuf {
    let path = temp.path().join("spec.json");
    std::fs::write(&path, serde_json::to_string_pretty(&toy_spec()).unwrap()).unwrap();
    path
}

#[test]
fn test_init_creates_session_once() {
    let temp = TempDir::new().unwrap();
    let config = write_spec(&temp);
    let dir = temp.path().join("run");
    let registry = toy_registry();

    let outcome = init::execute(&registry, &config, Some(dir.clone()), None).unwrap();
    assert_eq!(outcome, InitOutcome::Created(dir.clone()));
    assert!(dir.join("checkpoints/0/checkpoint.json").exists());

    let outcome = init::execute(&registry, &config, Some(dir.clone()), None).unwrap();
    assert_eq!(outcome, InitOutcome::AlreadyExists(dir));
}

#[test]
fn test_init_uses_session_dir_from_spec_and_overrides() {
    let temp = TempDir::new().unwrap();
    let config = write_spec(&temp);
    let dir = temp.path().join("from-spec");
    let overrides = temp.path().join("override.json");
    std::fs::write(
        &overrides,
        serde_json::to_string(&json!({
            "session_dir": dir,
            "train": {"stages": [{"name": "warmup", "epochs": 1}]}
        }))
        .unwrap(),
    )
    .unwrap();

    let registry = toy_registry();
    init::execute(&registry, &config, None, Some(&overrides)).unwrap();

    let (checkpoint, stages) = status::collect(dir).unwrap();
    assert_eq!(checkpoint, 0);
    assert_eq!(stages[0].name, "warmup");
    assert_eq!(stages[0].epochs, 1);
    assert_eq!(stages[1].name, "finetune");
}

#[test]
fn test_init_without_session_dir_fails() {
    let temp = TempDir::new().unwrap();
    let config = write_spec(&temp);
    let err = init::execute(&toy_registry(), &config, None, None).unwrap_err();
    assert!(err.to_string().contains("--session-dir"));
}

#[test]
fn test_train_then_status_reports_completion() {
    let temp = TempDir::new().unwrap();
    let config = write_spec(&temp);
    let dir = temp.path().join("run");
    let registry = toy_registry();
    init::execute(&registry, &config, Some(dir.clone()), None).unwrap();

    let (_, before) = status::collect(dir.clone()).unwrap();
    assert!(before.iter().all(|s| !s.completed && s.epochs_done == 0));

    train::execute(&registry, dir.clone()).unwrap();
    let (checkpoint, after) = status::collect(dir.clone()).unwrap();
    assert_eq!(checkpoint, 3);
    assert!(after.iter().all(|s| s.completed));
    assert_eq!(after[0].epochs_done, 2);
    assert!(dir.join("metrics/warmup.csv").exists());
    assert!(dir.join("metrics/finetune.csv").exists());

    // A finished session trains nothing more.
    train::execute(&registry, dir.clone()).unwrap();
    assert_eq!(status::collect(dir).unwrap().0, 3);
}
