use std::process::Stdio;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::WorkerCommand;
use crate::domain::DatasetId;
use crate::error::SparchiveError;
use crate::progress::DiagnosticFilter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseQuery {
    pub query: String,
    pub page: u32,
    pub limit: u32,
}

impl Default for BrowseQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            page: 1,
            limit: 20,
        }
    }
}

/// Datasets are passed through untouched; their shape belongs to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseResults {
    pub datasets: Vec<Value>,
    #[serde(default, alias = "total_count")]
    pub total_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BrowseDocument {
    Failure { error: String },
    Results(BrowseResults),
}

/// Builds and runs worker invocations.
#[derive(Debug, Clone)]
pub struct Worker {
    command: WorkerCommand,
    diagnostics: DiagnosticFilter,
}

impl Worker {
    pub fn new(command: WorkerCommand, diagnostics: DiagnosticFilter) -> Self {
        Self {
            command,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &DiagnosticFilter {
        &self.diagnostics
    }

    pub fn package_args(id: &DatasetId, output_dir: &Utf8Path) -> Vec<String> {
        vec![
            "package".to_string(),
            id.as_str().to_string(),
            output_dir.to_string(),
        ]
    }

    pub fn browse_args(query: &BrowseQuery) -> Vec<String> {
        vec![
            "browse".to_string(),
            "--query".to_string(),
            query.query.clone(),
            "--page".to_string(),
            query.page.to_string(),
            "--limit".to_string(),
            query.limit.to_string(),
        ]
    }

    /// A command with all three standard streams piped. The child is killed if its handle is dropped.
    pub fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs a one-shot browse query; the whole stdout must be a single JSON document.
    pub async fn browse(&self, query: &BrowseQuery) -> Result<BrowseResults, SparchiveError> {
        let args = Self::browse_args(query);
        debug!(program = %self.command.program.display(), ?args, "running browse");
        let mut cmd = self.command(&args);
        cmd.stdin(Stdio::null());
        let output = cmd
            .output()
            .await
            .map_err(|err| SparchiveError::WorkerSpawn(err.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = stderr
            .lines()
            .filter(|line| !self.diagnostics.is_benign(line))
            .collect::<Vec<_>>();
        for line in &diagnostics {
            warn!(line, "browse worker diagnostic");
        }

        if !output.status.success() {
            let message = if diagnostics.is_empty() {
                format!("worker exited with {}", output.status)
            } else {
                diagnostics.join("\n")
            };
            return Err(SparchiveError::WorkerReported(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let document: BrowseDocument = serde_json::from_str(stdout.trim())
            .map_err(|err| SparchiveError::WorkerProtocol(err.to_string()))?;
        match document {
            BrowseDocument::Failure { error } => Err(SparchiveError::WorkerReported(error)),
            BrowseDocument::Results(results) => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browse_document_variants() {
        let results: BrowseDocument =
            serde_json::from_str(r#"{"datasets": [{"id": 1}], "totalCount": 41}"#).unwrap();
        assert!(matches!(results, BrowseDocument::Results(BrowseResults { total_count: 41, .. })));

        let failure: BrowseDocument = serde_json::from_str(r#"{"error": "boom"}"#).unwrap();
        assert!(matches!(failure, BrowseDocument::Failure { error } if error == "boom"));
    }

    #[test]
    fn package_args_follow_worker_convention() {
        let id: DatasetId = "292".parse().unwrap();
        assert_eq!(
            Worker::package_args(&id, Utf8Path::new("/data/archives")),
            vec!["package", "292", "/data/archives"]
        );
        let query = BrowseQuery {
            query: "heart".to_string(),
            page: 2,
            limit: 10,
        };
        assert_eq!(
            Worker::browse_args(&query),
            vec!["browse", "--query", "heart", "--page", "2", "--limit", "10"]
        );
    }
}
