use std::fs;

use gold_config::{GoldConfig, ensure_workspace_config, gold_dir};
use gold_core::{Label, LabelChoice, Scope};
use goldd::Backends;
use goldd::cli::{LogArgs, ScopeArgs, UndoArgs};
use serde_json::{Value, json};
use tempfile::tempdir;

const TILE: &str = r#"{
    "commits": [
        {"hash": "aaa", "index": 0, "timestamp": 10, "author": "a@example.com", "subject": "first"},
        {"hash": "bbb", "index": 1, "timestamp": 20, "author": "b@example.com", "subject": "second"}
    ],
    "traces": [
        {"params": {"name": "circle", "device": "x86", "source_type": "gm"}, "digests": ["good", "bad"]},
        {"params": {"name": "circle", "device": "arm", "source_type": "gm"}, "digests": ["good", null]}
    ]
}"#;

fn workspace_with_tile() -> Result<(tempfile::TempDir, GoldConfig), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = ensure_workspace_config(temp.path())?;
    fs::write(gold_dir(temp.path()).join("tile.json"), TILE)?;
    config.storage.tile_path = Some("tile.json".to_owned());
    Ok((temp, config))
}

fn log_args() -> LogArgs {
    LogArgs {
        scope: ScopeArgs {
            issue: None,
            crs: None,
        },
        offset: 0,
        size: 20,
        details: true,
    }
}

#[test]
fn by_blame_command_prints_groups() -> Result<(), Box<dyn std::error::Error>> {
    let (temp, config) = workspace_with_tile()?;
    let backends = Backends::open(temp.path(), &config)?;

    let mut out = Vec::new();
    goldd::run_by_blame(&backends, "gm", &mut out)?;
    let groups: Value = serde_json::from_slice(&out)?;
    let ids: Vec<_> = groups
        .as_array()
        .expect("groups")
        .iter()
        .map(|group| group["groupID"].clone())
        .collect();
    assert_eq!(ids, vec![json!("aaa"), json!("bbb")]);
    assert_eq!(groups[1]["commits"][0]["author"], "b@example.com");

    assert!(goldd::run_by_blame(&backends, "", &mut Vec::new()).is_err());
    Ok(())
}

#[test]
fn configured_ignores_drop_traces_from_blame() -> Result<(), Box<dyn std::error::Error>> {
    let (temp, mut config) = workspace_with_tile()?;
    config.ignores.trace_ids = vec![",device=x86,name=circle,source_type=gm,".to_owned()];
    let backends = Backends::open(temp.path(), &config)?;

    let mut out = Vec::new();
    goldd::run_by_blame(&backends, "gm", &mut out)?;
    let groups: Value = serde_json::from_slice(&out)?;
    let ids: Vec<_> = groups
        .as_array()
        .expect("groups")
        .iter()
        .map(|group| group["groupID"].clone())
        .collect();
    assert_eq!(ids, vec![json!("aaa")]);
    assert_eq!(groups[0]["affectedTests"][0]["sample_digest"], "good");
    Ok(())
}

#[test]
fn triage_persists_across_reopen_and_undo() -> Result<(), Box<dyn std::error::Error>> {
    let (temp, config) = workspace_with_tile()?;
    let record_id = {
        let backends = Backends::open(temp.path(), &config)?;
        let engine = gold_analysis::TriageEngine::new(backends.store.clone());
        let request = gold_analysis::TriageRequest::new(Scope::Primary)
            .with_change("circle", "good", LabelChoice::Set(Label::Positive))
            .with_change("circle", "bad", LabelChoice::Set(Label::Negative));
        engine.triage("dev@example.com", &request)?.id
    };
    assert!(gold_dir(temp.path()).join("expectations.sqlite").exists());

    let backends = Backends::open(temp.path(), &config)?;
    let mut out = Vec::new();
    goldd::run_by_blame(&backends, "gm", &mut out)?;
    assert_eq!(serde_json::from_slice::<Value>(&out)?, json!([]));

    let mut out = Vec::new();
    goldd::run_undo(
        &backends,
        &UndoArgs {
            id: record_id,
            user: "reviewer@example.com".to_owned(),
        },
        &mut out,
    )?;
    let entry: Value = serde_json::from_slice(&out)?;
    assert_eq!(entry["name"], "reviewer@example.com");
    assert_eq!(entry["changeCount"], 2);
    assert_eq!(entry["details"][0]["label"], "untriaged");

    let mut out = Vec::new();
    goldd::run_log(&backends, &log_args(), &mut out)?;
    let log: Value = serde_json::from_slice(&out)?;
    assert_eq!(log["total"], 2);
    assert_eq!(log["entries"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn empty_sqlite_path_keeps_expectations_in_memory() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = GoldConfig::default();
    config.storage.sqlite_path = String::new();

    let backends = Backends::open(temp.path(), &config)?;
    let mut out = Vec::new();
    goldd::run_log(&backends, &log_args(), &mut out)?;
    assert_eq!(serde_json::from_slice::<Value>(&out)?["total"], 0);
    assert!(!gold_dir(temp.path()).join("expectations.sqlite").exists());
    Ok(())
}

#[test]
fn missing_tile_file_fails_to_open() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = ensure_workspace_config(temp.path())?;
    config.storage.tile_path = Some("absent.json".to_owned());

    let err = Backends::open(temp.path(), &config).err().expect("open should fail");
    assert!(format!("{err:#}").contains("absent.json"));
    Ok(())
}
