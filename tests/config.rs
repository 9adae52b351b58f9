use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;

use sparchive::config::{
    Config, ConfigLoader, DEFAULT_WORKER_PROGRAM, DefaultDecision, default_diagnostic_denylist,
};
use sparchive::error::SparchiveError;

#[test]
fn explicit_config_file_is_loaded() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("sparchive.json");
    std::fs::write(
        &path,
        r#"{
            "data_dir": "/srv/sparchive",
            "worker": {"program": "python3", "args": ["-m", "packager"]},
            "diagnostic_denylist": ["noise"],
            "confirmation": {"timeout_secs": 30}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.data_dir.as_str(), "/srv/sparchive");
    assert_eq!(resolved.worker.program, PathBuf::from("python3"));
    assert_eq!(resolved.worker.args, vec!["-m", "packager"]);
    assert_eq!(resolved.diagnostic_denylist, vec!["noise"]);
    assert_eq!(resolved.confirmation.timeout, Some(Duration::from_secs(30)));
    assert_eq!(resolved.confirmation.default, DefaultDecision::Cancel);
}

#[test]
fn missing_explicit_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, SparchiveError::ConfigRead(p) if p == path);
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("sparchive.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, SparchiveError::ConfigParse(_));
}

#[test]
fn blank_values_fall_back_to_defaults() {
    let config: Config = serde_json::from_str(
        r#"{"data_dir": "/tmp/s", "worker": {"program": "  "}, "confirmation": {"default": "confirm"}}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.worker.program, PathBuf::from(DEFAULT_WORKER_PROGRAM));
    assert_eq!(resolved.diagnostic_denylist, default_diagnostic_denylist());
    assert_eq!(resolved.confirmation.timeout, Some(Duration::from_secs(300)));
    assert!(resolved.confirmation.default.confirmed());
}
