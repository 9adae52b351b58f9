use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::SparchiveError;

pub const CONFIG_FILE_NAME: &str = "sparchive.json";
pub const DEFAULT_WORKER_PROGRAM: &str = "sparchive-packager";
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub worker: Option<WorkerEntry>,
    #[serde(default)]
    pub diagnostic_denylist: Option<Vec<String>>,
    #[serde(default)]
    pub confirmation: Option<ConfirmationEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WorkerEntry {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfirmationEntry {
    /// `null` disables the timeout; absent keeps the default.
    #[serde(default, deserialize_with = "explicit_option")]
    pub timeout_secs: Option<Option<u64>>,
    #[serde(default)]
    pub default: Option<DefaultDecision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    Confirm,
    Cancel,
}

impl DefaultDecision {
    pub fn confirmed(self) -> bool {
        matches!(self, DefaultDecision::Confirm)
    }
}

/// Program and prefix arguments used to launch the packager worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub timeout: Option<Duration>,
    pub default: DefaultDecision,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS)),
            default: DefaultDecision::Cancel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: Utf8PathBuf,
    pub worker: WorkerCommand,
    pub diagnostic_denylist: Vec<String>,
    pub confirmation: ConfirmationPolicy,
}

impl ResolvedConfig {
    pub fn archives_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("archives")
    }

    pub fn store_path(&self) -> Utf8PathBuf {
        self.data_dir.join("store.json")
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `sparchive.json` in the default data dir when no path is given.
    ///
    /// A missing default file resolves to built-in defaults; a missing explicit file is an error.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SparchiveError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => default_data_dir()?.join(CONFIG_FILE_NAME).into_std_path_buf(),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SparchiveError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SparchiveError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SparchiveError> {
        let data_dir = match config.data_dir {
            Some(dir) if !dir.trim().is_empty() => Utf8PathBuf::from(dir),
            _ => default_data_dir()?,
        };

        let worker = config.worker.unwrap_or_default();
        let worker = WorkerCommand {
            program: worker
                .program
                .filter(|program| !program.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PROGRAM)),
            args: worker.args,
        };

        let diagnostic_denylist = config
            .diagnostic_denylist
            .unwrap_or_else(default_diagnostic_denylist)
            .into_iter()
            .filter(|pattern| !pattern.is_empty())
            .collect();

        let mut confirmation = ConfirmationPolicy::default();
        if let Some(entry) = config.confirmation {
            if let Some(timeout) = entry.timeout_secs {
                confirmation.timeout = timeout.map(Duration::from_secs);
            }
            if let Some(default) = entry.default {
                confirmation.default = default;
            }
        }

        Ok(ResolvedConfig {
            data_dir,
            worker,
            diagnostic_denylist,
            confirmation,
        })
    }
}

pub fn default_diagnostic_denylist() -> Vec<String> {
    vec![
        "pkg_resources is deprecated".to_string(),
        "declare_namespace".to_string(),
        "SciCrunch API Key: Not Found".to_string(),
    ]
}

fn default_data_dir() -> Result<Utf8PathBuf, SparchiveError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("sparchive")).ok())
        .ok_or_else(|| SparchiveError::Filesystem("unable to resolve data directory".to_string()))
}

fn explicit_option<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<u64>::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_config_is_empty() {
        let resolved = ConfigLoader::resolve_config(Config {
            data_dir: Some("/tmp/sparchive-test".to_string()),
            ..Config::default()
        })
        .unwrap();
        assert_eq!(resolved.worker.program, PathBuf::from(DEFAULT_WORKER_PROGRAM));
        assert!(resolved.worker.args.is_empty());
        assert_eq!(resolved.diagnostic_denylist, default_diagnostic_denylist());
        assert_eq!(resolved.confirmation, ConfirmationPolicy::default());
        assert_eq!(resolved.archives_dir().as_str(), "/tmp/sparchive-test/archives");
        assert_eq!(resolved.store_path().as_str(), "/tmp/sparchive-test/store.json");
    }

    #[test]
    fn null_timeout_disables_confirmation_timeout() {
        let config: Config = serde_json::from_str(
            r#"{"data_dir": "/tmp/x", "confirmation": {"timeout_secs": null, "default": "confirm"}}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.confirmation.timeout, None);
        assert_eq!(resolved.confirmation.default, DefaultDecision::Confirm);
    }
}
