use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive;
use crate::domain::{DatasetId, LibraryEntry};
use crate::error::SparchiveError;
use crate::fs_util;
use crate::store::{ArchiveLayout, KeyValueStore};

/// Store key holding the ordered library index.
pub const LIBRARY_KEY: &str = "library";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImportOutcome {
    Success {
        message: String,
        library: Vec<LibraryEntry>,
    },
    Exists {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Ordered, persisted collection of library entries, newest first.
///
/// Every mutation holds the entry lock for the whole read-modify-persist cycle,
/// so job completion, import and delete never interleave. Persistence failures
/// are logged and the in-memory list stays authoritative.
pub struct LibraryStore {
    backend: Arc<dyn KeyValueStore>,
    layout: ArchiveLayout,
    entries: Mutex<Vec<LibraryEntry>>,
}

impl LibraryStore {
    pub fn load(backend: Arc<dyn KeyValueStore>, layout: ArchiveLayout) -> Self {
        let entries = match backend.get(LIBRARY_KEY) {
            Ok(Some(value)) => decode_entries(value),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "failed to load library index, starting empty");
                Vec::new()
            }
        };
        debug!(entries = entries.len(), "library loaded");
        Self {
            backend,
            layout,
            entries: Mutex::new(entries),
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn list(&self) -> Vec<LibraryEntry> {
        self.lock().clone()
    }

    pub fn get(&self, id: &DatasetId) -> Option<LibraryEntry> {
        self.lock().iter().find(|entry| &entry.id == id).cloned()
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.lock().iter().any(|entry| &entry.id == id)
    }

    /// Archive path of an entry whose backing file is still on disk.
    pub fn open_location(&self, id: &DatasetId) -> Option<Utf8PathBuf> {
        let path = self.get(id)?.archive_path;
        if path.as_std_path().is_file() {
            Some(path)
        } else {
            debug!(id = %id, path = %path, "archive file missing");
            None
        }
    }

    /// Replaces the entry with the same id in place, or prepends a new one.
    pub fn upsert(&self, entry: LibraryEntry) -> Vec<LibraryEntry> {
        let mut entries = self.lock();
        upsert_entry(&mut entries, entry);
        self.persist(&entries);
        entries.clone()
    }

    /// Removes the entry and its archive file. The file removal is best-effort.
    pub fn delete(&self, id: &DatasetId) -> Vec<LibraryEntry> {
        let mut entries = self.lock();
        let Some(position) = entries.iter().position(|entry| &entry.id == id) else {
            debug!(id = %id, "delete requested for unknown dataset");
            return entries.clone();
        };

        let removed = entries.remove(position);
        match fs::remove_file(removed.archive_path.as_std_path()) {
            Ok(()) => info!(id = %id, path = %removed.archive_path, "archive deleted"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %removed.archive_path, "archive already absent");
            }
            Err(err) => {
                warn!(path = %removed.archive_path, error = %err, "failed to delete archive file");
            }
        }
        self.persist(&entries);
        entries.clone()
    }

    /// Adds a user-supplied archive, copying it into managed storage.
    ///
    /// An id that is already present is reported as `Exists`, never overwritten.
    pub fn import(&self, source: &Path) -> ImportOutcome {
        let manifest = match archive::read_manifest(source) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                return ImportOutcome::Error {
                    message: format!(
                        "Invalid archive: {} not found.",
                        archive::MANIFEST_ENTRY
                    ),
                };
            }
            Err(err) => {
                warn!(path = %source.display(), error = %err, "import failed to read archive");
                return ImportOutcome::Error {
                    message: err.to_string(),
                };
            }
        };

        if manifest.dataset_id.is_empty() {
            return ImportOutcome::Error {
                message: "Invalid manifest: dataset_id is missing.".to_string(),
            };
        }

        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.id == manifest.dataset_id) {
            return ImportOutcome::Exists {
                message: format!(
                    "Dataset {} is already in your library.",
                    manifest.dataset_id
                ),
            };
        }

        let copied = self.layout.archive_path(&manifest.dataset_id).and_then(|dest| {
            fs_util::copy_file_atomic(source, dest.as_std_path())?;
            Ok(dest)
        });
        let dest = match copied {
            Ok(dest) => dest,
            Err(err) => {
                warn!(error = %err, "import failed to copy archive");
                return ImportOutcome::Error {
                    message: err.to_string(),
                };
            }
        };

        info!(id = %manifest.dataset_id, path = %dest, "dataset imported");
        upsert_entry(&mut entries, LibraryEntry::from_manifest(&manifest, dest));
        self.persist(&entries);
        ImportOutcome::Success {
            message: "Dataset imported successfully!".to_string(),
            library: entries.clone(),
        }
    }

    fn persist(&self, entries: &[LibraryEntry]) {
        let result = serde_json::to_value(entries)
            .map_err(|err| SparchiveError::StoreIo(err.to_string()))
            .and_then(|value| self.backend.set(LIBRARY_KEY, value));
        if let Err(err) = result {
            warn!(error = %err, "failed to persist library index");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LibraryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn upsert_entry(entries: &mut Vec<LibraryEntry>, entry: LibraryEntry) {
    match entries.iter_mut().find(|existing| existing.id == entry.id) {
        Some(existing) => *existing = entry,
        None => entries.insert(0, entry),
    }
}

/// Decodes entries one by one so a single malformed record does not drop the library.
fn decode_entries(value: Value) -> Vec<LibraryEntry> {
    let Value::Array(items) = value else {
        warn!("library index is not an array, ignoring it");
        return Vec::new();
    };
    let mut entries: Vec<LibraryEntry> = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<LibraryEntry>(item) {
            Ok(entry) if entries.iter().any(|existing| existing.id == entry.id) => {
                warn!(id = %entry.id, "duplicate library entry dropped");
            }
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(error = %err, "malformed library entry dropped"),
        }
    }
    entries
}
