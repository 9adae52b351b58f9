#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use sparchive::config::{ConfirmationPolicy, ResolvedConfig, WorkerCommand, default_diagnostic_denylist};
use sparchive::jobs::JobHandle;
use sparchive::progress::{ProgressEvent, ProgressUpdate};

pub fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

pub fn manifest_json(id: &str, title: &str) -> Vec<u8> {
    serde_json::json!({
        "dataset_id": id,
        "dataset_title": title,
        "authors": ["Ada Lovelace"],
        "file_tree": [
            {"type": "folder", "name": "primary", "children": [
                {"type": "file", "name": "table.csv", "size": 11}
            ]}
        ]
    })
    .to_string()
    .into_bytes()
}

pub fn utf8(path: PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path).unwrap()
}

/// Runs `body` with `/bin/sh`; the worker command arguments follow as `$1..`.
pub fn shell_worker(dir: &Path, body: &str) -> WorkerCommand {
    let script = dir.join("worker.sh");
    fs::write(&script, body).unwrap();
    WorkerCommand {
        program: PathBuf::from("/bin/sh"),
        args: vec![script.to_string_lossy().into_owned()],
    }
}

pub fn test_config(data_dir: &Path, worker: WorkerCommand) -> ResolvedConfig {
    ResolvedConfig {
        data_dir: utf8(data_dir.to_path_buf()),
        worker,
        diagnostic_denylist: default_diagnostic_denylist(),
        confirmation: ConfirmationPolicy {
            timeout: None,
            ..ConfirmationPolicy::default()
        },
    }
}

pub async fn next_update(rx: &mut UnboundedReceiver<ProgressUpdate>) -> ProgressUpdate {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a progress event")
        .expect("progress channel closed")
}

/// Collects events of `handle` up to and including its terminal event.
pub async fn collect_job(rx: &mut UnboundedReceiver<ProgressUpdate>, handle: JobHandle) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let update = next_update(rx).await;
        if update.job != handle {
            continue;
        }
        let terminal = update.event.is_terminal();
        events.push(update.event);
        if terminal {
            return events;
        }
    }
}
