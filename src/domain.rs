use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SparchiveError;

/// Title used when a manifest does not carry one.
pub const UNTITLED: &str = "N/A";

/// Dataset identifier, compared as a trimmed string.
///
/// Workers and older library files emit ids as JSON numbers, so
/// deserialization accepts numbers, strings and `null` (empty id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks that the id can be used as a file stem inside the archives directory.
    pub fn validate_file_stem(&self) -> Result<(), SparchiveError> {
        let value = self.0.as_str();
        let is_valid = !value.is_empty()
            && value != "."
            && !value.contains("..")
            && !value
                .chars()
                .any(|ch| ch == '/' || ch == '\\' || ch == ':' || ch.is_control());
        if !is_valid {
            return Err(SparchiveError::InvalidDatasetId(value.to_string()));
        }
        Ok(())
    }

    fn normalize(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = SparchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let id = Self::normalize(value);
        id.validate_file_stem()?;
        Ok(id)
    }
}

impl From<u64> for DatasetId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDatasetId {
    Text(String),
    Number(serde_json::Number),
    Null,
}

impl<'de> Deserialize<'de> for DatasetId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawDatasetId::deserialize(deserializer)? {
            RawDatasetId::Text(value) => Self::normalize(&value),
            RawDatasetId::Number(value) => Self(value.to_string()),
            RawDatasetId::Null => Self::default(),
        })
    }
}

/// One node of the virtual file tree recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileNode {
    Folder {
        name: String,
        #[serde(default)]
        children: Vec<FileNode>,
    },
    File {
        name: String,
        #[serde(default)]
        size: u64,
    },
}

impl FileNode {
    pub fn name(&self) -> &str {
        match self {
            FileNode::Folder { name, .. } | FileNode::File { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(Vec<FileNode>);

impl FileTree {
    pub fn new(nodes: Vec<FileNode>) -> Self {
        Self(nodes)
    }

    pub fn nodes(&self) -> &[FileNode] {
        &self.0
    }

    /// Looks up a node by its `/`-joined internal path.
    pub fn find(&self, internal_path: &str) -> Option<&FileNode> {
        let mut level = self.0.as_slice();
        let mut found = None;
        for part in internal_path.split('/').filter(|part| !part.is_empty()) {
            let node = level.iter().find(|node| node.name() == part)?;
            level = match node {
                FileNode::Folder { children, .. } => children.as_slice(),
                FileNode::File { .. } => &[],
            };
            found = Some(node);
        }
        found
    }

    /// Every file in the tree as `(internal path, size)`, depth first.
    pub fn files(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, &FileNode)> = self
            .0
            .iter()
            .rev()
            .map(|node| (node.name().to_string(), node))
            .collect();
        while let Some((path, node)) = stack.pop() {
            match node {
                FileNode::File { size, .. } => out.push((path, *size)),
                FileNode::Folder { children, .. } => {
                    for child in children.iter().rev() {
                        stack.push((format!("{path}/{}", child.name()), child));
                    }
                }
            }
        }
        out
    }

    pub fn file_count(&self) -> usize {
        self.files().len()
    }

    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|(_, size)| size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub dataset_id: DatasetId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dataset_title: String,
    #[serde(default)]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_tree: FileTree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: DatasetId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "path", alias = "archive_path")]
    pub archive_path: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl LibraryEntry {
    pub fn from_manifest(manifest: &Manifest, archive_path: Utf8PathBuf) -> Self {
        let title = if manifest.dataset_title.trim().is_empty() {
            UNTITLED.to_string()
        } else {
            manifest.dataset_title.clone()
        };
        Self {
            id: manifest.dataset_id.clone(),
            title,
            authors: manifest.authors.clone(),
            archive_path,
            thumbnail: manifest.thumbnail.clone(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
