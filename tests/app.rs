#![cfg(unix)]

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use tokio::sync::mpsc;

use sparchive::app::App;
use sparchive::archive::{FileContent, MANIFEST_ENTRY};
use sparchive::error::SparchiveError;
use sparchive::jobs::JobState;
use sparchive::library::ImportOutcome;
use sparchive::progress::ProgressEvent;
use sparchive::worker::BrowseQuery;

use common::{collect_job, manifest_json, shell_worker, test_config, write_archive};

const BROWSE_WORKER: &str = r#"
[ "$1" = "browse" ] || exit 9
echo 'SciCrunch API Key: Not Found' >&2
case "$3" in
  ok)
    echo '{"datasets": [{"id": 1, "name": "Heart"}, {"id": 2, "name": "Lung"}],'
    echo ' "totalCount": 2}'
    ;;
  remote-error)
    echo '{"error": "catalogue unavailable"}'
    ;;
  garbage)
    echo 'Searching...'
    ;;
  *)
    echo 'ValueError: bad page' >&2
    exit 1
    ;;
esac
"#;

fn query(text: &str) -> BrowseQuery {
    BrowseQuery {
        query: text.to_string(),
        ..BrowseQuery::default()
    }
}

#[tokio::test]
async fn browse_parses_whole_document() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(&test_config(temp.path(), shell_worker(temp.path(), BROWSE_WORKER)));

    let results = app.browse(&query("ok")).await.unwrap();
    assert_eq!(results.total_count, 2);
    assert_eq!(results.datasets[1]["name"], "Lung");

    let err = app.browse(&query("remote-error")).await.unwrap_err();
    assert_matches!(err, SparchiveError::WorkerReported(message) if message == "catalogue unavailable");

    let err = app.browse(&query("garbage")).await.unwrap_err();
    assert_matches!(err, SparchiveError::WorkerProtocol(_));

    let err = app.browse(&query("fail")).await.unwrap_err();
    assert_matches!(err, SparchiveError::WorkerReported(message) if message == "ValueError: bad page");
}

#[tokio::test]
async fn package_then_view_through_app() {
    let temp = tempfile::tempdir().unwrap();
    let worker = shell_worker(
        temp.path(),
        r#"
echo '{"status":"confirm_download","message":"?","value":{"file_count":1,"total_size_bytes":11}}'
read answer
[ "$answer" = "confirm" ] || exit 0
echo "{\"status\":\"done\",\"message\":\"ok\",\"value\":{\"path\":\"$3/$2.sparc\",\"manifest\":{\"dataset_id\":$2,\"dataset_title\":\"Heart\",\"file_tree\":[]}}}"
"#,
    );
    let app = App::new(&test_config(&temp.path().join("data"), worker));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = app.subscribe_progress(Arc::new(tx));

    let handle = app.start_package(&"31".parse().unwrap()).await;
    loop {
        let update = common::next_update(&mut rx).await;
        if matches!(update.event, ProgressEvent::ConfirmDownload { .. }) {
            break;
        }
    }
    assert!(app.confirm_package(true).await);
    let events = collect_job(&mut rx, handle).await;
    assert_matches!(events.last(), Some(ProgressEvent::Done { .. }));
    assert_eq!(app.jobs().state(handle), Some(JobState::Completed));
    subscription.unsubscribe();

    let library = app.get_library().await;
    assert_eq!(library.len(), 1);
    assert_eq!(library[0].title, "Heart");

    let remaining = app.delete_dataset("31".parse().unwrap()).await;
    assert!(remaining.is_empty());
    assert!(app.get_library().await.is_empty());
}

#[tokio::test]
async fn imported_archive_is_browsable() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(&test_config(
        &temp.path().join("data"),
        shell_worker(temp.path(), BROWSE_WORKER),
    ));
    let source = temp.path().join("incoming.sparc");
    write_archive(
        &source,
        &[
            (MANIFEST_ENTRY, &manifest_json("77", "Kidney")),
            ("primary/table.csv", b"h1,h2\nx,y\n"),
        ],
    );

    assert_matches!(app.import_archive(source.clone()).await, ImportOutcome::Success { .. });
    assert_matches!(app.import_archive(source).await, ImportOutcome::Exists { .. });

    let path = app.open_location(&"77".parse().unwrap()).await.unwrap();
    let manifest = app.get_manifest(path.clone().into_std_path_buf()).await.unwrap();
    assert_eq!(manifest.dataset_title, "Kidney");

    let content = app
        .get_file_content(path.clone().into_std_path_buf(), "primary/table.csv".to_string())
        .await;
    assert_matches!(content, Some(FileContent::Table(table)) if table.rows.len() == 1);

    let dest = temp.path().join("out.csv");
    let outcome = app
        .extract_file(path.into_std_path_buf(), "primary/table.csv".to_string(), dest.clone())
        .await;
    assert!(outcome.success);
    assert_eq!(std::fs::read_to_string(dest).unwrap(), "h1,h2\nx,y\n");

    let err = app.open_location(&"78".parse().unwrap()).await.unwrap_err();
    assert_matches!(err, SparchiveError::DatasetNotFound(_));
}
