use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::Manifest;
use crate::error::SparchiveError;
use crate::fs_util;
use crate::table::Table;

/// Reserved entry at the archive root holding the manifest JSON.
pub const MANIFEST_ENTRY: &str = "viewer_manifest.json";

/// Decoded payload of one archive entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileContent {
    Image {
        #[serde(rename = "mimeType")]
        mime_type: &'static str,
        /// Base64 of the raw bytes.
        data: String,
    },
    Text {
        data: String,
    },
    Table(Table),
    /// The entry exists but no viewer handles its extension.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

enum ContentKind {
    Image(&'static str),
    Text,
    Delimited(u8),
    Workbook,
    Unsupported,
}

fn content_kind(internal_path: &str) -> ContentKind {
    let extension = Path::new(internal_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => ContentKind::Image("image/png"),
        "jpg" | "jpeg" => ContentKind::Image("image/jpeg"),
        "gif" => ContentKind::Image("image/gif"),
        "svg" => ContentKind::Image("image/svg+xml"),
        "json" | "txt" | "md" => ContentKind::Text,
        "csv" => ContentKind::Delimited(b','),
        "tsv" => ContentKind::Delimited(b'\t'),
        "xlsx" => ContentKind::Workbook,
        _ => ContentKind::Unsupported,
    }
}

/// Reads the manifest of the archive at `path`.
///
/// `Ok(None)` when the archive opens but has no manifest entry; errors for an
/// unreadable archive or a manifest that is not valid JSON.
pub fn read_manifest(path: &Path) -> Result<Option<Manifest>, SparchiveError> {
    let mut archive = fs_util::open_archive(path)?;
    let Some(bytes) = fs_util::read_entry(&mut archive, MANIFEST_ENTRY)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| SparchiveError::ArchiveCorrupt(format!("{MANIFEST_ENTRY}: {err}")))
}

/// Resolves manifests and entry content out of produced archives.
///
/// Every call opens the archive afresh; nothing is cached between requests.
/// Failures never cross this boundary as errors: they are logged and reported
/// as `None` or a failed [`ExtractOutcome`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveResolver;

impl ArchiveResolver {
    pub fn get_manifest(&self, path: &Path) -> Option<Manifest> {
        match read_manifest(path) {
            Ok(Some(manifest)) => Some(manifest),
            Ok(None) => {
                debug!(path = %path.display(), "archive has no manifest");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read manifest");
                None
            }
        }
    }

    /// `None` when the entry is missing or cannot be decoded;
    /// [`FileContent::Unsupported`] when it exists but has no viewer.
    pub fn get_file_content(&self, path: &Path, internal_path: &str) -> Option<FileContent> {
        match self.resolve(path, internal_path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    entry = internal_path,
                    error = %err,
                    "failed to resolve archive entry"
                );
                None
            }
        }
    }

    pub fn extract_file(&self, path: &Path, internal_path: &str, dest: &Path) -> ExtractOutcome {
        let result = fs_util::open_archive(path)
            .and_then(|mut archive| fs_util::copy_entry_atomic(&mut archive, internal_path, dest));
        match result {
            Ok(()) => {
                debug!(entry = internal_path, dest = %dest.display(), "entry extracted");
                ExtractOutcome::ok()
            }
            Err(err) => {
                warn!(entry = internal_path, error = %err, "extraction failed");
                ExtractOutcome::failed(err.to_string())
            }
        }
    }

    fn resolve(
        &self,
        path: &Path,
        internal_path: &str,
    ) -> Result<Option<FileContent>, SparchiveError> {
        let mut archive = fs_util::open_archive(path)?;
        let Some(bytes) = fs_util::read_entry(&mut archive, internal_path)? else {
            return Ok(None);
        };

        let content = match content_kind(internal_path) {
            ContentKind::Image(mime_type) => FileContent::Image {
                mime_type,
                data: STANDARD.encode(&bytes),
            },
            ContentKind::Text => FileContent::Text {
                data: String::from_utf8_lossy(&bytes).into_owned(),
            },
            ContentKind::Delimited(delimiter) => {
                FileContent::Table(Table::from_delimited(&bytes, delimiter)?)
            }
            ContentKind::Workbook => FileContent::Table(Table::from_xlsx(&bytes)?),
            ContentKind::Unsupported => FileContent::Unsupported,
        };
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_dispatch_is_case_insensitive() {
        assert!(matches!(content_kind("a/B.PNG"), ContentKind::Image("image/png")));
        assert!(matches!(content_kind("x.JPEG"), ContentKind::Image("image/jpeg")));
        assert!(matches!(content_kind("notes.md"), ContentKind::Text));
        assert!(matches!(content_kind("t.tsv"), ContentKind::Delimited(b'\t')));
        assert!(matches!(content_kind("s.xlsx"), ContentKind::Workbook));
        assert!(matches!(content_kind("scan.nii.gz"), ContentKind::Unsupported));
        assert!(matches!(content_kind("Makefile"), ContentKind::Unsupported));
    }

    #[test]
    fn content_serializes_with_type_tag() {
        let image = FileContent::Image {
            mime_type: "image/gif",
            data: "R0lG".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&image).unwrap(),
            serde_json::json!({"type": "image", "mimeType": "image/gif", "data": "R0lG"})
        );
        assert_eq!(
            serde_json::to_value(FileContent::Unsupported).unwrap(),
            serde_json::json!({"type": "unsupported"})
        );
        assert_eq!(
            serde_json::to_value(FileContent::Table(Table::default())).unwrap(),
            serde_json::json!({"type": "table", "columns": [], "rows": []})
        );
    }
}
