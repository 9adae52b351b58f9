//! Progress protocol spoken by the packager worker and the fan-out to subscribers.
//!
//! The worker prints one JSON object per stdout line:
//!
//! ```text
//! {"status": "progress", "message": "Downloading file 3 of 9", "value": 0.33}
//! {"status": "confirm_download", "message": "...", "value": {"file_count": 9, "total_size_bytes": 1048576}}
//! {"status": "done", "message": "Packaging complete!", "value": {"path": "...", "manifest": {...}}}
//! ```
//!
//! Lines that are not protocol messages are dropped. Diagnostic (stderr) lines
//! are matched against a denylist of benign noise; anything else becomes an
//! `error` event carrying the raw line with `fatal: false`. Only a fatal
//! `error` ends a job.

use std::sync::{Arc, Mutex, Weak};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::domain::Manifest;
use crate::jobs::JobHandle;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressEvent {
    Starting {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction_complete: Option<f64>,
    },
    Progress {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction_complete: Option<f64>,
    },
    /// The worker is paused until a confirm/cancel decision is written to its stdin.
    ConfirmDownload {
        file_count: u64,
        total_size_bytes: u64,
    },
    Exists {
        message: String,
    },
    Done {
        manifest: Manifest,
        archive_path: Utf8PathBuf,
    },
    Error {
        message: String,
        fatal: bool,
    },
}

impl ProgressEvent {
    /// A terminal error.
    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
            fatal: true,
        }
    }

    /// A surfaced worker diagnostic; the job keeps running.
    pub fn diagnostic(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Exists { .. }
                | ProgressEvent::Done { .. }
                | ProgressEvent::Error { fatal: true, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub job: JobHandle,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ConfirmPayload {
    #[serde(alias = "fileCount")]
    file_count: u64,
    #[serde(alias = "total_size", alias = "totalSizeBytes")]
    total_size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct DonePayload {
    #[serde(alias = "archive_path")]
    path: Utf8PathBuf,
    manifest: Manifest,
}

/// Parses one worker stdout line. `None` for anything that is not a protocol message.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let raw: Value = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(_) => {
            debug!(line = trimmed, "discarding non-protocol worker output");
            return None;
        }
    };
    let wire: WireMessage = match serde_json::from_value(raw.clone()) {
        Ok(wire) => wire,
        Err(err) => {
            debug!(line = trimmed, error = %err, "discarding JSON without a status");
            return None;
        }
    };

    let message = wire.message.unwrap_or_default();
    let event = match wire.status.as_str() {
        "starting" => ProgressEvent::Starting {
            message,
            fraction_complete: fraction(wire.value.as_ref()),
        },
        "progress" => ProgressEvent::Progress {
            message,
            fraction_complete: fraction(wire.value.as_ref()),
        },
        "confirm_download" => {
            let payload = wire.value.unwrap_or(raw);
            match serde_json::from_value::<ConfirmPayload>(payload) {
                Ok(confirm) => ProgressEvent::ConfirmDownload {
                    file_count: confirm.file_count,
                    total_size_bytes: confirm.total_size_bytes,
                },
                Err(err) => {
                    debug!(error = %err, "discarding malformed confirm_download");
                    return None;
                }
            }
        }
        "exists" => ProgressEvent::Exists { message },
        "done" => match wire.value.map(serde_json::from_value::<DonePayload>) {
            Some(Ok(done)) => ProgressEvent::Done {
                manifest: done.manifest,
                archive_path: done.path,
            },
            Some(Err(err)) => {
                debug!(error = %err, "discarding malformed done payload");
                return None;
            }
            None => {
                debug!("discarding done without payload");
                return None;
            }
        },
        "error" => ProgressEvent::error(message),
        other => {
            debug!(status = other, "discarding unknown worker status");
            return None;
        }
    };
    Some(event)
}

fn fraction(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
}

/// Substring denylist for worker diagnostics that are known to be harmless.
#[derive(Debug, Clone)]
pub struct DiagnosticFilter {
    denylist: Vec<String>,
}

impl DiagnosticFilter {
    pub fn new(denylist: Vec<String>) -> Self {
        Self { denylist }
    }

    pub fn is_benign(&self, line: &str) -> bool {
        line.trim().is_empty() || self.denylist.iter().any(|pattern| line.contains(pattern.as_str()))
    }

    /// `Some(error)` for a diagnostic line that should reach the subscriber.
    pub fn classify(&self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if self.is_benign(line) {
            debug!(line, "suppressed benign worker diagnostic");
            return None;
        }
        Some(ProgressEvent::diagnostic(line))
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, job: JobHandle, event: &ProgressEvent);
}

impl ProgressSink for UnboundedSender<ProgressUpdate> {
    fn event(&self, job: JobHandle, event: &ProgressEvent) {
        let _ = self.send(ProgressUpdate {
            job,
            event: event.clone(),
        });
    }
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    sinks: Vec<(u64, Arc<dyn ProgressSink>)>,
}

/// Fan-out of progress events to the attached sinks.
#[derive(Clone, Default)]
pub struct ProgressHub {
    inner: Arc<Mutex<HubInner>>,
}

impl ProgressHub {
    pub fn subscribe(&self, sink: Arc<dyn ProgressSink>) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sinks.push((id, sink));
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn publish(&self, job: JobHandle, event: &ProgressEvent) {
        let sinks: Vec<Arc<dyn ProgressSink>> = {
            let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.sinks.iter().map(|(_, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.event(job, event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.sinks.len())
            .unwrap_or_default()
    }
}

/// Detaches its sink when unsubscribed or dropped.
pub struct Subscription {
    hub: Weak<Mutex<HubInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut inner = hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.sinks.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn progress_fraction_is_clamped() {
        let event =
            parse_progress_line(r#"{"status":"progress","message":"half","value":1.7}"#).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Progress {
                message: "half".to_string(),
                fraction_complete: Some(1.0),
            }
        );
    }

    #[test]
    fn non_protocol_lines_are_discarded() {
        assert!(parse_progress_line("Downloading...").is_none());
        assert!(parse_progress_line("[1, 2]").is_none());
        assert!(parse_progress_line(r#"{"status":"dancing"}"#).is_none());
        assert!(parse_progress_line(r#"{"status":"done","message":"no payload"}"#).is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn confirm_download_reads_value_payload() {
        let event = parse_progress_line(
            r#"{"status":"confirm_download","message":"ok?","value":{"file_count":3,"total_size_bytes":2048}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ProgressEvent::ConfirmDownload {
                file_count: 3,
                total_size_bytes: 2048,
            }
        );
    }

    #[test]
    fn done_carries_manifest_and_path() {
        let event = parse_progress_line(
            r#"{"status":"done","message":"Packaging complete!","value":{"path":"/out/9.sparc","manifest":{"dataset_id":9,"dataset_title":"Nine","file_tree":[]}}}"#,
        )
        .unwrap();
        assert!(event.is_terminal());
        assert_matches!(
            event,
            ProgressEvent::Done { manifest, archive_path }
                if manifest.dataset_id.as_str() == "9" && archive_path.as_str() == "/out/9.sparc"
        );
    }

    #[test]
    fn denylisted_diagnostics_are_suppressed() {
        let filter = DiagnosticFilter::new(crate::config::default_diagnostic_denylist());
        assert!(filter.classify("pkg_resources is deprecated").is_none());
        assert!(filter
            .classify("UserWarning: pkg_resources is deprecated as an API")
            .is_none());
        assert!(filter.classify("   ").is_none());
        assert_eq!(
            filter.classify("Traceback (most recent call last):"),
            Some(ProgressEvent::diagnostic("Traceback (most recent call last):"))
        );
        assert!(!ProgressEvent::diagnostic("boom").is_terminal());
        assert!(ProgressEvent::error("boom").is_terminal());
    }

    #[test]
    fn error_events_carry_fatal_flag() {
        let reported = parse_progress_line(r#"{"status":"error","message":"no such dataset"}"#).unwrap();
        assert_eq!(
            serde_json::to_value(&reported).unwrap(),
            serde_json::json!({"status": "error", "message": "no such dataset", "fatal": true})
        );
        assert_eq!(
            serde_json::to_value(ProgressEvent::diagnostic("warn")).unwrap()["fatal"],
            serde_json::json!(false)
        );
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let hub = ProgressHub::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = hub.subscribe(Arc::new(tx));
        let job = JobHandle::new(1);
        hub.publish(job, &ProgressEvent::error("first"));
        subscription.unsubscribe();
        hub.publish(job, &ProgressEvent::error("second"));

        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(rx.try_recv().unwrap().event, ProgressEvent::error("first"));
        assert!(rx.try_recv().is_err());
    }
}
