use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SparchiveError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to launch worker: {0}")]
    #[diagnostic(help("check `worker.program` in sparchive.json"))]
    WorkerSpawn(String),

    #[error("worker returned malformed output: {0}")]
    WorkerProtocol(String),

    #[error("{0}")]
    WorkerReported(String),

    #[error("invalid or corrupt package: {0}")]
    ArchiveCorrupt(String),

    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),

    #[error("archive read failed: {0}")]
    ArchiveIo(String),

    #[error("library store failure: {0}")]
    StoreIo(String),

    #[error("{0}")]
    DatasetExists(String),

    #[error("dataset not found in library: {0}")]
    DatasetNotFound(String),
}
