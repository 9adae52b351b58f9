use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::SparchiveError;

pub type Archive = ZipArchive<fs::File>;

pub fn open_archive(archive_path: &Path) -> Result<Archive, SparchiveError> {
    let file = fs::File::open(archive_path).map_err(|err| {
        SparchiveError::ArchiveCorrupt(format!("open {}: {err}", archive_path.display()))
    })?;
    ZipArchive::new(file).map_err(|err| {
        SparchiveError::ArchiveCorrupt(format!("read {}: {err}", archive_path.display()))
    })
}

/// Reads one entry fully into memory. `Ok(None)` when the entry does not exist.
pub fn read_entry(archive: &mut Archive, internal_path: &str) -> Result<Option<Vec<u8>>, SparchiveError> {
    let mut entry = match archive.by_name(entry_name(internal_path)) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(SparchiveError::ArchiveIo(err.to_string())),
    };
    if entry.is_dir() {
        return Ok(None);
    }
    let mut buffer = Vec::with_capacity(entry.size().min(64 * 1024 * 1024) as usize);
    entry
        .read_to_end(&mut buffer)
        .map_err(|err| SparchiveError::ArchiveIo(format!("{internal_path}: {err}")))?;
    Ok(Some(buffer))
}

/// Streams one entry to `dest` through a temp file in the destination directory.
pub fn copy_entry_atomic(
    archive: &mut Archive,
    internal_path: &str,
    dest: &Path,
) -> Result<(), SparchiveError> {
    let mut entry = match archive.by_name(entry_name(internal_path)) {
        Ok(entry) if !entry.is_dir() => entry,
        Ok(_) | Err(ZipError::FileNotFound) => {
            return Err(SparchiveError::ArchiveIo(format!(
                "entry not found in archive: {internal_path}"
            )));
        }
        Err(err) => return Err(SparchiveError::ArchiveIo(err.to_string())),
    };

    let parent = parent_dir(dest);
    fs::create_dir_all(parent).map_err(|err| SparchiveError::ArchiveIo(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("sparchive-extract")
        .tempfile_in(parent)
        .map_err(|err| SparchiveError::ArchiveIo(err.to_string()))?;
    io::copy(&mut entry, temp.as_file_mut())
        .map_err(|err| SparchiveError::ArchiveIo(format!("{internal_path}: {err}")))?;
    temp.persist(dest)
        .map_err(|err| SparchiveError::ArchiveIo(err.to_string()))?;
    Ok(())
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), SparchiveError> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent).map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("sparchive-write")
        .tempfile_in(parent)
        .map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Path, dest: &Path) -> Result<(), SparchiveError> {
    let parent = parent_dir(dest);
    fs::create_dir_all(parent).map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("sparchive-file")
        .tempfile_in(parent)
        .map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    temp.persist(dest)
        .map_err(|err| SparchiveError::Filesystem(err.to_string()))?;
    Ok(())
}

fn entry_name(internal_path: &str) -> &str {
    internal_path.trim_start_matches("./").trim_start_matches('/')
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
