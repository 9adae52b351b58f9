//! Supervision of the single in-flight packaging job.
//!
//! [`JobManager`] owns zero or one live job record. Starting a job retires the
//! previous record, waits until its worker has been killed and reaped, and
//! only then spawns the new one. Every delivery re-checks the active handle
//! under the slot lock, and the relay of a superseded job acknowledges the
//! kill only after its last publish, so no old event follows the new `starting`.
//!
//! ```text
//! Spawning -> Running -> AwaitingConfirmation -> Running | Aborted
//!                     -> Completed | Errored | Preempted
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::ConfirmationPolicy;
use crate::domain::{DatasetId, LibraryEntry};
use crate::error::SparchiveError;
use crate::library::LibraryStore;
use crate::progress::{ProgressEvent, ProgressHub, parse_progress_line};
use crate::worker::Worker;

const FINISHED_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Spawning,
    Running,
    AwaitingConfirmation,
    Aborted,
    Completed,
    Errored,
    Preempted,
}

struct JobRecord {
    handle: JobHandle,
    state: JobState,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    kill: Option<oneshot::Sender<KillAck>>,
    confirmation_timer: Option<AbortHandle>,
    confirmation_seq: u64,
    terminal_sent: bool,
}

impl JobRecord {
    fn spawning(handle: JobHandle) -> Self {
        Self {
            handle,
            state: JobState::Spawning,
            stdin: None,
            kill: None,
            confirmation_timer: None,
            confirmation_seq: 0,
            terminal_sent: false,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.confirmation_timer.take() {
            timer.abort();
        }
    }
}

/// Sent back by the relay once a killed worker has been reaped.
type KillAck = oneshot::Sender<()>;

#[derive(Default)]
struct Slot {
    active: Option<JobRecord>,
    finished: VecDeque<(JobHandle, JobState)>,
}

impl Slot {
    fn active_mut(&mut self, handle: JobHandle) -> Option<&mut JobRecord> {
        self.active.as_mut().filter(|record| record.handle == handle)
    }

    fn remember(&mut self, handle: JobHandle, state: JobState) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((handle, state));
    }
}

/// What `deliver` decided under the slot lock.
enum Delivery {
    Drop,
    Publish(ProgressEvent),
    Complete(LibraryEntry, ProgressEvent),
    Refuse(u64),
}

struct Shared {
    worker: Worker,
    library: Arc<LibraryStore>,
    hub: ProgressHub,
    policy: ConfirmationPolicy,
    next_id: AtomicU64,
    slot: Mutex<Slot>,
    /// Serializes kill-then-spawn so two workers never overlap.
    launch: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    pub fn new(
        worker: Worker,
        library: Arc<LibraryStore>,
        hub: ProgressHub,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker,
                library,
                hub,
                policy,
                next_id: AtomicU64::new(1),
                slot: Mutex::new(Slot::default()),
                launch: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.shared.hub
    }

    /// Starts packaging `id`, replacing any job in flight.
    ///
    /// An id already in the library yields a single `exists` event and no worker.
    /// Returns once the new worker has been launched and the previous one reaped.
    pub async fn start_package(&self, id: &DatasetId) -> JobHandle {
        let shared = &self.shared;
        let handle = shared.next_handle();

        if shared.library.contains(id) {
            info!(%handle, id = %id, "dataset already in library, not starting worker");
            shared.hub.publish(
                handle,
                &ProgressEvent::Exists {
                    message: format!("Dataset {id} is already in your library."),
                },
            );
            return handle;
        }

        let layout = shared.library.layout();
        if let Err(err) = layout.ensure_archives_dir() {
            shared.hub.publish(handle, &ProgressEvent::error(err.to_string()));
            return handle;
        }

        let args = Worker::package_args(id, layout.archives_dir());
        shared
            .start(handle, format!("Starting packager for dataset {id}"), args)
            .await;
        handle
    }

    /// Starts an arbitrary streaming worker command, replacing any job in flight.
    pub async fn start(&self, starting_message: impl Into<String>, args: Vec<String>) -> JobHandle {
        let handle = self.shared.next_handle();
        self.shared.start(handle, starting_message.into(), args).await;
        handle
    }

    /// Resolves a pending confirmation. Returns `false` (and does nothing) when
    /// `handle` is not the active job or is not waiting for a decision.
    pub async fn decide(&self, handle: JobHandle, confirmed: bool) -> bool {
        Shared::decide(&self.shared, handle, confirmed, None).await
    }

    /// Resolves the pending confirmation of whichever job is active.
    pub async fn decide_active(&self, confirmed: bool) -> bool {
        match self.active_job() {
            Some(handle) => self.decide(handle, confirmed).await,
            None => {
                debug!("confirmation decision with no active job ignored");
                false
            }
        }
    }

    /// Cooperative cancel. A pending confirmation is answered with `cancel`;
    /// otherwise the job is marked aborted so a later confirmation request is
    /// refused and a later `done` is not reconciled. The worker is never killed here.
    pub async fn cancel(&self, handle: JobHandle) -> bool {
        let awaiting = {
            let mut slot = self.shared.lock_slot();
            let Some(record) = slot.active_mut(handle) else {
                return false;
            };
            if record.terminal_sent {
                return false;
            }
            if record.state == JobState::AwaitingConfirmation {
                true
            } else {
                record.state = JobState::Aborted;
                false
            }
        };
        if awaiting {
            return self.decide(handle, false).await;
        }
        info!(%handle, "job marked as cancelled");
        true
    }

    pub fn active_job(&self) -> Option<JobHandle> {
        self.shared.lock_slot().active.as_ref().map(|record| record.handle)
    }

    /// Current state of the active job, or the final state of a recently finished one.
    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        let slot = self.shared.lock_slot();
        if let Some(record) = slot.active.as_ref().filter(|record| record.handle == handle) {
            return Some(record.state);
        }
        slot.finished
            .iter()
            .rev()
            .find(|(finished, _)| *finished == handle)
            .map(|(_, state)| *state)
    }

    /// Kills the active worker, if any, without emitting further events.
    pub async fn shutdown(&self) {
        let _launch = self.shared.launch.lock().await;
        let reaped = {
            let mut slot = self.shared.lock_slot();
            slot.active
                .take()
                .and_then(|record| Shared::preempt(&mut slot, record))
        };
        wait_reaped(reaped).await;
    }
}

impl Shared {
    fn next_handle(&self) -> JobHandle {
        JobHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn start(self: &Arc<Self>, handle: JobHandle, starting_message: String, args: Vec<String>) {
        let _launch = self.launch.lock().await;
        let reaped = {
            let mut slot = self.lock_slot();
            let reaped = slot
                .active
                .take()
                .and_then(|previous| Self::preempt(&mut slot, previous));
            slot.active = Some(JobRecord::spawning(handle));
            reaped
        };
        wait_reaped(reaped).await;

        self.hub.publish(
            handle,
            &ProgressEvent::Starting {
                message: starting_message,
                fraction_complete: None,
            },
        );

        let mut child = match self.worker.command(&args).spawn() {
            Ok(child) => child,
            Err(err) => {
                let err = SparchiveError::WorkerSpawn(err.to_string());
                warn!(%handle, error = %err, "worker spawn failed");
                {
                    let mut slot = self.lock_slot();
                    slot.active = None;
                    slot.remember(handle, JobState::Errored);
                }
                self.hub.publish(handle, &ProgressEvent::error(err.to_string()));
                return;
            }
        };
        info!(%handle, pid = ?child.id(), ?args, "worker started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        if let Some(record) = self.lock_slot().active_mut(handle) {
            if record.state == JobState::Spawning {
                record.state = JobState::Running;
            }
            record.stdin = stdin.map(|stdin| Arc::new(tokio::sync::Mutex::new(stdin)));
            record.kill = Some(kill_tx);
        }

        tokio::spawn(relay(Arc::clone(self), handle, child, stdout, stderr, kill_rx));
    }

    /// Retires `record` and asks its relay to kill the worker. The returned
    /// receiver resolves once the worker has been reaped.
    fn preempt(slot: &mut Slot, mut record: JobRecord) -> Option<oneshot::Receiver<()>> {
        info!(handle = %record.handle, "preempting active job");
        record.cancel_timer();
        slot.remember(record.handle, JobState::Preempted);
        let kill = record.kill.take()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        kill.send(ack_tx).ok()?;
        Some(ack_rx)
    }

    /// Forwards one event if `handle` is still the active job.
    ///
    /// Sinks are called with the slot lock released, so they may query the manager.
    async fn deliver(self: &Arc<Self>, handle: JobHandle, event: ProgressEvent) {
        let delivery = {
            let mut slot = self.lock_slot();
            match slot.active_mut(handle) {
                None => {
                    debug!(%handle, "dropping event for superseded job");
                    Delivery::Drop
                }
                Some(record) if record.terminal_sent => {
                    debug!(%handle, "dropping event after terminal event");
                    Delivery::Drop
                }
                Some(record) => self.transition(record, event),
            }
        };

        match delivery {
            Delivery::Drop => {}
            Delivery::Publish(event) => self.hub.publish(handle, &event),
            Delivery::Complete(entry, event) => {
                let library = Arc::clone(&self.library);
                if let Err(err) = tokio::task::spawn_blocking(move || library.upsert(entry)).await {
                    warn!(%handle, error = %err, "library update task failed");
                }
                self.hub.publish(handle, &event);
            }
            Delivery::Refuse(seq) => {
                Shared::decide(self, handle, false, Some(seq)).await;
            }
        }
    }

    fn transition(self: &Arc<Self>, record: &mut JobRecord, event: ProgressEvent) -> Delivery {
        let handle = record.handle;
        match &event {
            ProgressEvent::Starting { .. } | ProgressEvent::Progress { .. } => {
                if record.state == JobState::Spawning {
                    record.state = JobState::Running;
                }
            }
            ProgressEvent::ConfirmDownload { .. } => {
                record.confirmation_seq += 1;
                let aborted = record.state == JobState::Aborted;
                record.state = JobState::AwaitingConfirmation;
                if aborted {
                    info!(%handle, "job already cancelled, refusing download");
                    return Delivery::Refuse(record.confirmation_seq);
                }
                record.cancel_timer();
                record.confirmation_timer =
                    self.schedule_confirmation_timeout(handle, record.confirmation_seq);
            }
            ProgressEvent::Done {
                manifest,
                archive_path,
            } => {
                if record.state == JobState::Aborted {
                    info!(%handle, "ignoring completion of a cancelled job");
                    return Delivery::Drop;
                }
                record.terminal_sent = true;
                if manifest.dataset_id.is_empty() {
                    record.state = JobState::Errored;
                    return Delivery::Publish(ProgressEvent::error(
                        "worker reported a manifest without dataset_id",
                    ));
                }
                info!(%handle, id = %manifest.dataset_id, path = %archive_path, "job completed");
                record.state = JobState::Completed;
                let entry = LibraryEntry::from_manifest(manifest, archive_path.clone());
                return Delivery::Complete(entry, event);
            }
            ProgressEvent::Exists { .. } => {
                record.state = JobState::Completed;
                record.terminal_sent = true;
            }
            ProgressEvent::Error { fatal: true, .. } => {
                record.state = JobState::Errored;
                record.terminal_sent = true;
            }
            ProgressEvent::Error { fatal: false, .. } => {}
        }
        Delivery::Publish(event)
    }

    fn schedule_confirmation_timeout(self: &Arc<Self>, handle: JobHandle, seq: u64) -> Option<AbortHandle> {
        let timeout = self.policy.timeout?;
        let shared = Arc::clone(self);
        let confirmed = self.policy.default.confirmed();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Detached so that the decision cancelling this timer cannot cut its own write short.
            tokio::spawn(async move {
                if Shared::decide(&shared, handle, confirmed, Some(seq)).await {
                    warn!(%handle, confirmed, "confirmation timed out, applied default decision");
                }
            });
        });
        Some(timer.abort_handle())
    }

    async fn decide(
        shared: &Arc<Self>,
        handle: JobHandle,
        confirmed: bool,
        expected_seq: Option<u64>,
    ) -> bool {
        let stdin = {
            let mut slot = shared.lock_slot();
            let Some(record) = slot.active_mut(handle) else {
                debug!(%handle, "decision for inactive job ignored");
                return false;
            };
            let seq_matches = expected_seq.is_none_or(|seq| seq == record.confirmation_seq);
            if record.state != JobState::AwaitingConfirmation || !seq_matches {
                debug!(%handle, state = ?record.state, "no confirmation pending");
                return false;
            }
            record.cancel_timer();
            record.state = if confirmed {
                JobState::Running
            } else {
                JobState::Aborted
            };
            record.stdin.clone()
        };

        let Some(stdin) = stdin else {
            warn!(%handle, "worker stdin unavailable for decision");
            return false;
        };
        let token: &[u8] = if confirmed { b"confirm\n" } else { b"cancel\n" };
        let mut stdin = stdin.lock().await;
        let written = match stdin.write_all(token).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => {
                info!(%handle, confirmed, "confirmation decision sent");
                true
            }
            Err(err) => {
                warn!(%handle, error = %err, "failed to write decision to worker");
                false
            }
        }
    }

    /// Called once the worker has exited; synthesizes the terminal event if the worker sent none.
    fn finish(&self, handle: JobHandle, status: std::io::Result<ExitStatus>) {
        let synthesized = {
            let mut slot = self.lock_slot();
            let Some(mut record) = slot.active.take_if(|record| record.handle == handle) else {
                return;
            };
            record.cancel_timer();

            let mut final_state = record.state;
            let mut synthesized = None;
            if !record.terminal_sent {
                let message = match (&record.state, &status) {
                    (JobState::Aborted, _) => "packaging cancelled".to_string(),
                    (_, Ok(status)) if status.success() => {
                        "worker exited without reporting a result".to_string()
                    }
                    (_, Ok(status)) => format!("worker exited with {status}"),
                    (_, Err(err)) => format!("failed to wait for worker: {err}"),
                };
                final_state = JobState::Errored;
                synthesized = Some(ProgressEvent::error(message));
            }
            debug!(%handle, state = ?final_state, status = ?status, "job finished");
            slot.remember(handle, final_state);
            synthesized
        };
        if let Some(event) = synthesized {
            self.hub.publish(handle, &event);
        }
    }
}

async fn wait_reaped(reaped: Option<oneshot::Receiver<()>>) {
    if let Some(reaped) = reaped {
        let _ = reaped.await;
    }
}

enum Step {
    Killed(Option<KillAck>),
    Stdout(std::io::Result<Option<Vec<u8>>>),
    Stderr(std::io::Result<Option<Vec<u8>>>),
}

async fn relay(
    shared: Arc<Shared>,
    handle: JobHandle,
    mut child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut kill_rx: oneshot::Receiver<KillAck>,
) {
    let mut stdout = stdout.map(|stream| BufReader::new(stream).split(b'\n'));
    let mut stderr = stderr.map(|stream| BufReader::new(stream).split(b'\n'));

    while stdout.is_some() || stderr.is_some() {
        let step = tokio::select! {
            ack = &mut kill_rx => Step::Killed(ack.ok()),
            line = next_segment(&mut stdout), if stdout.is_some() => Step::Stdout(line),
            line = next_segment(&mut stderr), if stderr.is_some() => Step::Stderr(line),
        };
        match step {
            Step::Killed(ack) => {
                kill(handle, &mut child, ack).await;
                return;
            }
            Step::Stdout(Ok(Some(line))) => {
                if let Some(event) = parse_progress_line(&String::from_utf8_lossy(&line)) {
                    shared.deliver(handle, event).await;
                }
            }
            Step::Stderr(Ok(Some(line))) => {
                let line = String::from_utf8_lossy(&line);
                if let Some(event) = shared.worker.diagnostics().classify(&line) {
                    shared.deliver(handle, event).await;
                }
            }
            Step::Stdout(result) => {
                if let Err(err) = result {
                    warn!(%handle, error = %err, "worker stdout read failed");
                }
                stdout = None;
            }
            Step::Stderr(result) => {
                if let Err(err) = result {
                    warn!(%handle, error = %err, "worker stderr read failed");
                }
                stderr = None;
            }
        }
    }

    let exited = tokio::select! {
        ack = &mut kill_rx => Err(ack.ok()),
        status = child.wait() => Ok(status),
    };
    match exited {
        Ok(status) => shared.finish(handle, status),
        Err(ack) => kill(handle, &mut child, ack).await,
    }
}

async fn next_segment<R>(
    lines: &mut Option<tokio::io::Split<R>>,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_segment().await,
        None => Ok(None),
    }
}

async fn kill(handle: JobHandle, child: &mut Child, ack: Option<KillAck>) {
    if let Err(err) = child.kill().await {
        warn!(%handle, error = %err, "failed to kill preempted worker");
    } else {
        debug!(%handle, "preempted worker killed");
    }
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}
