use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::warn;

use crate::archive::{ArchiveResolver, ExtractOutcome, FileContent};
use crate::config::ResolvedConfig;
use crate::domain::{DatasetId, LibraryEntry, Manifest};
use crate::error::SparchiveError;
use crate::jobs::{JobHandle, JobManager};
use crate::library::{ImportOutcome, LibraryStore};
use crate::progress::{DiagnosticFilter, ProgressHub, ProgressSink, Subscription};
use crate::store::{ArchiveLayout, JsonFileStore, KeyValueStore};
use crate::worker::{BrowseQuery, BrowseResults, Worker};

/// Host-facing operation surface.
///
/// Library and archive operations run on the blocking pool; packaging runs as a
/// supervised job whose progress reaches subscribers through the hub.
#[derive(Clone)]
pub struct App {
    library: Arc<LibraryStore>,
    worker: Worker,
    jobs: JobManager,
    resolver: ArchiveResolver,
}

impl App {
    /// Opens the library stored at `config.store_path()`.
    pub fn new(config: &ResolvedConfig) -> Self {
        Self::with_store(config, Arc::new(JsonFileStore::new(config.store_path())))
    }

    pub fn with_store(config: &ResolvedConfig, backend: Arc<dyn KeyValueStore>) -> Self {
        let library = Arc::new(LibraryStore::load(
            backend,
            ArchiveLayout::from_config(config),
        ));
        let worker = Worker::new(
            config.worker.clone(),
            DiagnosticFilter::new(config.diagnostic_denylist.clone()),
        );
        let jobs = JobManager::new(
            worker.clone(),
            Arc::clone(&library),
            ProgressHub::default(),
            config.confirmation,
        );
        Self {
            library,
            worker,
            jobs,
            resolver: ArchiveResolver,
        }
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub async fn browse(&self, query: &BrowseQuery) -> Result<BrowseResults, SparchiveError> {
        self.worker.browse(query).await
    }

    /// Fire-and-forget; progress is delivered to subscribers.
    pub async fn start_package(&self, id: &DatasetId) -> JobHandle {
        self.jobs.start_package(id).await
    }

    pub fn subscribe_progress(&self, sink: Arc<dyn ProgressSink>) -> Subscription {
        self.jobs.hub().subscribe(sink)
    }

    /// Answers the pending confirmation of the active job. `false` if none was pending.
    pub async fn confirm_package(&self, confirmed: bool) -> bool {
        self.jobs.decide_active(confirmed).await
    }

    pub async fn cancel_package(&self, handle: JobHandle) -> bool {
        self.jobs.cancel(handle).await
    }

    pub async fn get_library(&self) -> Vec<LibraryEntry> {
        self.library.list()
    }

    pub async fn delete_dataset(&self, id: DatasetId) -> Vec<LibraryEntry> {
        let library = Arc::clone(&self.library);
        let fallback = Arc::clone(&self.library);
        blocking(move || library.delete(&id))
            .await
            .unwrap_or_else(|| fallback.list())
    }

    pub async fn import_archive(&self, source: PathBuf) -> ImportOutcome {
        let library = Arc::clone(&self.library);
        blocking(move || library.import(&source))
            .await
            .unwrap_or_else(|| ImportOutcome::Error {
                message: "import task failed".to_string(),
            })
    }

    pub async fn open_location(&self, id: &DatasetId) -> Result<Utf8PathBuf, SparchiveError> {
        self.library
            .open_location(id)
            .ok_or_else(|| SparchiveError::DatasetNotFound(id.to_string()))
    }

    pub async fn get_manifest(&self, path: PathBuf) -> Option<Manifest> {
        let resolver = self.resolver;
        blocking(move || resolver.get_manifest(&path)).await.flatten()
    }

    pub async fn get_file_content(&self, path: PathBuf, internal_path: String) -> Option<FileContent> {
        let resolver = self.resolver;
        blocking(move || resolver.get_file_content(&path, &internal_path))
            .await
            .flatten()
    }

    pub async fn extract_file(
        &self,
        path: PathBuf,
        internal_path: String,
        dest: PathBuf,
    ) -> ExtractOutcome {
        let resolver = self.resolver;
        blocking(move || resolver.extract_file(&path, &internal_path, &dest))
            .await
            .unwrap_or_else(|| ExtractOutcome {
                success: false,
                error: Some("extract task failed".to_string()),
            })
    }

    /// Kills any worker still running.
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
    }
}

async fn blocking<T, F>(task: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "blocking task failed");
            None
        }
    }
}
