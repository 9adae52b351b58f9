use camino::Utf8PathBuf;

use sparchive::domain::DatasetId;
use sparchive::store::{ArchiveLayout, JsonFileStore, KeyValueStore};

#[test]
fn layout_paths() {
    let layout = ArchiveLayout::new(Utf8PathBuf::from("/data/sparchive/archives"));
    let id: DatasetId = "292".parse().unwrap();
    let path = layout.archive_path(&id).unwrap();
    assert!(path.ends_with("archives/292.sparc"));
    assert!(path.starts_with(layout.archives_dir()));
}

#[test]
fn store_keeps_unrelated_keys() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();
    std::fs::write(path.as_std_path(), r#"{"theme": "dark"}"#).unwrap();

    let store = JsonFileStore::new(path.clone());
    store.set("library", serde_json::json!([])).unwrap();

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(path.as_std_path()).unwrap()).unwrap();
    assert_eq!(raw, serde_json::json!({"theme": "dark", "library": []}));
}

#[test]
fn blank_store_file_reads_as_empty() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();
    std::fs::write(path.as_std_path(), "\n").unwrap();
    assert_eq!(JsonFileStore::new(path).get("library").unwrap(), None);
}
