use std::io::{self, Write};

use serde::Serialize;

use crate::archive::FileContent;
use crate::domain::{FileNode, LibraryEntry, Manifest};
use crate::progress::{ProgressEvent, ProgressUpdate};
use crate::worker::BrowseResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }

    /// One compact JSON document per line, for streamed progress.
    pub fn print_line<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_library(entries: &[LibraryEntry]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        if entries.is_empty() {
            writeln!(stdout, "library is empty")?;
            return Ok(());
        }
        for entry in entries {
            writeln!(stdout, "{}\t{}", entry.id, entry.title)?;
            if let Some(authors) = entry.authors.as_ref().filter(|authors| !authors.is_empty()) {
                writeln!(stdout, "  authors: {}", authors.join(", "))?;
            }
            writeln!(stdout, "  archive: {}", entry.archive_path)?;
        }
        Ok(())
    }

    pub fn print_browse(results: &BrowseResults) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{} datasets total", results.total_count)?;
        for dataset in &results.datasets {
            let id = dataset.get("id").map(|id| id.to_string()).unwrap_or_default();
            let name = dataset
                .get("name")
                .or_else(|| dataset.get("title"))
                .and_then(|name| name.as_str())
                .unwrap_or("");
            writeln!(stdout, "{id}\t{name}")?;
        }
        Ok(())
    }

    pub fn print_manifest(manifest: &Manifest) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "id:      {}", manifest.dataset_id)?;
        writeln!(stdout, "title:   {}", manifest.dataset_title)?;
        if let Some(authors) = &manifest.authors {
            writeln!(stdout, "authors: {}", authors.join(", "))?;
        }
        writeln!(
            stdout,
            "files:   {} ({})",
            manifest.file_tree.file_count(),
            format_size(manifest.file_tree.total_size())
        )?;
        Ok(())
    }

    pub fn print_tree(manifest: &Manifest) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        fn walk(out: &mut impl Write, nodes: &[FileNode], depth: usize) -> io::Result<()> {
            for node in nodes {
                let indent = "  ".repeat(depth);
                match node {
                    FileNode::Folder { name, children } => {
                        writeln!(out, "{indent}{name}/")?;
                        walk(out, children, depth + 1)?;
                    }
                    FileNode::File { name, size } => {
                        writeln!(out, "{indent}{name} ({})", format_size(*size))?;
                    }
                }
            }
            Ok(())
        }
        walk(&mut stdout, manifest.file_tree.nodes(), 0)
    }

    pub fn print_content(content: &FileContent) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        match content {
            FileContent::Text { data } => writeln!(stdout, "{data}"),
            FileContent::Image { mime_type, data } => writeln!(
                stdout,
                "{mime_type} image, {} bytes base64 (use `extract` to save it)",
                data.len()
            ),
            FileContent::Table(table) => {
                let header: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
                writeln!(stdout, "{}", header.join("\t"))?;
                for row in &table.rows {
                    let cells: Vec<String> = table
                        .columns
                        .iter()
                        .map(|column| match row.get(&column.key) {
                            Some(serde_json::Value::String(text)) => text.clone(),
                            Some(serde_json::Value::Null) | None => String::new(),
                            Some(other) => other.to_string(),
                        })
                        .collect();
                    writeln!(stdout, "{}", cells.join("\t"))?;
                }
                Ok(())
            }
            FileContent::Unsupported => writeln!(stdout, "no viewer for this file type"),
        }
    }

    /// Progress goes to stderr so stdout stays clean for piping.
    pub fn print_progress(update: &ProgressUpdate) {
        let line = match &update.event {
            ProgressEvent::Starting {
                message,
                fraction_complete,
            }
            | ProgressEvent::Progress {
                message,
                fraction_complete,
            } => match fraction_complete {
                Some(fraction) => format!("[{:>3.0}%] {message}", fraction * 100.0),
                None => format!("[....] {message}"),
            },
            ProgressEvent::ConfirmDownload {
                file_count,
                total_size_bytes,
            } => format!(
                "about to download {file_count} files ({})",
                format_size(*total_size_bytes)
            ),
            ProgressEvent::Exists { message } => message.clone(),
            ProgressEvent::Done { archive_path, .. } => {
                format!("packaging complete: {archive_path}")
            }
            ProgressEvent::Error {
                message,
                fatal: true,
            } => format!("error: {message}"),
            ProgressEvent::Error { message, .. } => format!("worker: {message}"),
        };
        eprintln!("{line}");
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
