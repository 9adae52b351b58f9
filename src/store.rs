use std::fs;
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::ResolvedConfig;
use crate::domain::DatasetId;
use crate::error::SparchiveError;
use crate::fs_util;

pub const ARCHIVE_EXTENSION: &str = "sparc";

/// Opaque JSON get/set persistence used for the library index.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, SparchiveError>;
    fn set(&self, key: &str, value: Value) -> Result<(), SparchiveError>;
}

/// All keys live in one JSON object file, rewritten atomically on every `set`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: Utf8PathBuf,
}

impl JsonFileStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>, SparchiveError> {
        match self.read_raw()? {
            Some(content) => parse_object(&content).map_err(|err| {
                SparchiveError::StoreIo(format!("parse {}: {err}", self.path))
            }),
            None => Ok(Map::new()),
        }
    }

    fn read_raw(&self) -> Result<Option<Vec<u8>>, SparchiveError> {
        match fs::read(self.path.as_std_path()) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SparchiveError::StoreIo(format!("read {}: {err}", self.path))),
        }
    }

    /// Current contents for a write. An unparsable file is renamed to
    /// `<name>.corrupt` so the store stays writable.
    fn read_for_update(&self) -> Result<Map<String, Value>, SparchiveError> {
        let Some(content) = self.read_raw()? else {
            return Ok(Map::new());
        };
        match parse_object(&content) {
            Ok(map) => Ok(map),
            Err(err) => {
                let aside = self.corrupt_path();
                warn!(path = %self.path, moved_to = %aside, error = %err, "store file unreadable, starting fresh");
                fs::rename(self.path.as_std_path(), aside.as_std_path())
                    .map_err(|err| SparchiveError::StoreIo(format!("move aside {}: {err}", self.path)))?;
                Ok(Map::new())
            }
        }
    }

    pub fn corrupt_path(&self) -> Utf8PathBuf {
        let mut name = self.path.file_name().unwrap_or("store.json").to_string();
        name.push_str(".corrupt");
        self.path.with_file_name(name)
    }
}

fn parse_object(content: &[u8]) -> Result<Map<String, Value>, String> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("not a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, SparchiveError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SparchiveError> {
        let mut map = self.read_for_update()?;
        map.insert(key.to_string(), value);
        let content = serde_json::to_vec_pretty(&Value::Object(map))
            .map_err(|err| SparchiveError::StoreIo(err.to_string()))?;
        fs_util::write_bytes_atomic(self.path.as_std_path(), &content)
            .map_err(|err| SparchiveError::StoreIo(err.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<Map<String, Value>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, SparchiveError> {
        let values = self
            .values
            .lock()
            .map_err(|_| SparchiveError::StoreIo("memory store poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SparchiveError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SparchiveError::StoreIo("memory store poisoned".to_string()))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Where managed archives live on disk.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    archives_dir: Utf8PathBuf,
}

impl ArchiveLayout {
    pub fn new(archives_dir: Utf8PathBuf) -> Self {
        Self { archives_dir }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.archives_dir())
    }

    pub fn archives_dir(&self) -> &Utf8Path {
        &self.archives_dir
    }

    pub fn archive_path(&self, id: &DatasetId) -> Result<Utf8PathBuf, SparchiveError> {
        id.validate_file_stem()?;
        Ok(self
            .archives_dir
            .join(format!("{}.{ARCHIVE_EXTENSION}", id.as_str())))
    }

    pub fn ensure_archives_dir(&self) -> Result<(), SparchiveError> {
        fs::create_dir_all(self.archives_dir.as_std_path())
            .map_err(|err| SparchiveError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn json_file_store_round_trips_keys() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/store.json")).unwrap();
        let store = JsonFileStore::new(path.clone());

        assert_eq!(store.get("library").unwrap(), None);
        store.set("library", serde_json::json!([1, 2])).unwrap();
        store.set("other", serde_json::json!("x")).unwrap();

        let reopened = JsonFileStore::new(path);
        assert_eq!(reopened.get("library").unwrap(), Some(serde_json::json!([1, 2])));
        assert_eq!(reopened.get("other").unwrap(), Some(serde_json::json!("x")));
    }

    #[test]
    fn json_file_store_reports_garbage() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();
        fs::write(path.as_std_path(), b"not json").unwrap();
        let err = JsonFileStore::new(path).get("library").unwrap_err();
        assert_matches!(err, SparchiveError::StoreIo(_));
    }

    #[test]
    fn set_moves_unparsable_file_aside() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();
        fs::write(path.as_std_path(), b"{ truncated").unwrap();
        let store = JsonFileStore::new(path.clone());

        store.set("library", serde_json::json!([])).unwrap();

        assert_eq!(store.get("library").unwrap(), Some(serde_json::json!([])));
        assert_eq!(fs::read(store.corrupt_path().as_std_path()).unwrap(), b"{ truncated");
        assert!(store.corrupt_path().as_str().ends_with("store.json.corrupt"));
    }

    #[test]
    fn archive_paths_are_derived_from_id() {
        let layout = ArchiveLayout::new(Utf8PathBuf::from("/data/archives"));
        let id: DatasetId = "292".parse().unwrap();
        assert_eq!(layout.archive_path(&id).unwrap().as_str(), "/data/archives/292.sparc");
        assert!(layout.archive_path(&DatasetId::default()).is_err());
    }
}
