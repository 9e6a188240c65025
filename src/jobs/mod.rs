//! In-memory job store and per-job progress bus.
//!
//! The store is the single owner of all job mutation. Every operation takes
//! one lock acquisition and performs no I/O while holding it (working
//! directory deletion is fire-and-forget, errors ignored). `subscribe`
//! replays the full event history and registers the new subscriber under the
//! same lock, so a late subscriber sees exactly the stream an early one saw;
//! no live event can slip between replay and registration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::options::BuildOptions;

pub type JobId = Uuid;

/// Job lifecycle states. Transitions only move forward; `complete` and
/// `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Complete | JobStatus::Error => 2,
        }
    }
}

/// Kind of a progress event. A stream carries any number of `log` events
/// and ends with exactly one `complete` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Complete,
    Error,
}

/// One immutable record in a job's event history.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl ProgressEvent {
    pub fn log(message: impl Into<String>, percent: Option<u8>) -> Self {
        Self {
            kind: EventKind::Log,
            message: Some(message.into()),
            percent,
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Complete,
            message: Some(message.into()),
            percent: Some(100),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            message: Some(message.into()),
            percent: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }
}

struct JobEntry {
    status: JobStatus,
    options: BuildOptions,
    work_dir: Option<PathBuf>,
    artifact_path: Option<PathBuf>,
    file_name: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    history: Vec<ProgressEvent>,
    subscribers: Vec<(u64, UnboundedSender<ProgressEvent>)>,
}

/// Cloneable read-only view of a job, safe to hand to handlers.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub options: BuildOptions,
    pub work_dir: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    pub file_name: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct Inner {
    jobs: HashMap<JobId, JobEntry>,
    next_subscriber_id: u64,
}

/// The authoritative record of every build's lifecycle state, event history,
/// and subscriber list. Process-lifetime state; nothing survives a restart.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl JobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                next_subscriber_id: 0,
            })),
            ttl,
        }
    }

    /// Create a job in `queued` and schedule its TTL deletion. The id is
    /// assigned once and never reused.
    pub fn create(&self, options: BuildOptions) -> JobId {
        let id = Uuid::new_v4();
        {
            let mut inner = self.lock();
            inner.jobs.insert(
                id,
                JobEntry {
                    status: JobStatus::Queued,
                    options,
                    work_dir: None,
                    artifact_path: None,
                    file_name: None,
                    error_message: None,
                    created_at: Utc::now(),
                    completed_at: None,
                    history: Vec::new(),
                    subscribers: Vec::new(),
                },
            );
        }
        // The expiry task needs a runtime; unit tests that construct a store
        // outside one simply get no automatic expiry.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.clone();
            let ttl = self.ttl;
            handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                if store.get(id).is_some() {
                    eprintln!("[jobs] job_id={} expired after {:?}, deleting", id, ttl);
                    store.delete(id);
                }
            });
        }
        id
    }

    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        let inner = self.lock();
        inner.jobs.get(&id).map(|entry| JobSnapshot {
            id,
            status: entry.status,
            options: entry.options.clone(),
            work_dir: entry.work_dir.clone(),
            artifact_path: entry.artifact_path.clone(),
            file_name: entry.file_name.clone(),
            error_message: entry.error_message.clone(),
            created_at: entry.created_at,
            completed_at: entry.completed_at,
        })
    }

    /// Number of jobs in `queued` or `running`: the admission-cap input.
    pub fn count_active(&self) -> usize {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    /// Record the working directory once the pipeline has created it.
    /// No-op on unknown id.
    pub fn assign_work_dir(&self, id: JobId, path: PathBuf) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(&id) {
            entry.work_dir = Some(path);
        }
    }

    /// Advance to `running`. Returns false if the job is unknown or the
    /// transition would move backwards.
    pub fn set_running(&self, id: JobId) -> bool {
        self.transition(id, JobStatus::Running, |_| {})
    }

    /// Terminal success: records the artifact and download file name.
    pub fn complete(&self, id: JobId, artifact_path: PathBuf, file_name: String) -> bool {
        self.transition(id, JobStatus::Complete, |entry| {
            entry.artifact_path = Some(artifact_path.clone());
            entry.file_name = Some(file_name.clone());
            entry.completed_at = Some(Utc::now());
        })
    }

    /// Terminal failure: records the error message.
    pub fn fail(&self, id: JobId, message: &str) -> bool {
        self.transition(id, JobStatus::Error, |entry| {
            entry.error_message = Some(message.to_string());
            entry.completed_at = Some(Utc::now());
        })
    }

    fn transition(
        &self,
        id: JobId,
        status: JobStatus,
        apply: impl Fn(&mut JobEntry),
    ) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return false;
        };
        if entry.status.is_terminal() || status.rank() < entry.status.rank() {
            return false;
        }
        entry.status = status;
        apply(entry);
        true
    }

    /// Append an event to the history, then fan it out to every live
    /// subscriber. Subscribers whose channel is gone are dropped; one dead
    /// subscriber never breaks emission to the others. No-op on unknown id.
    pub fn emit(&self, id: JobId, event: ProgressEvent) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(&id) {
            entry.history.push(event.clone());
            entry
                .subscribers
                .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    /// Replay the full history into a fresh channel, then register it for
    /// live events, atomically under a single lock acquisition. Returns
    /// `None` for an unknown job.
    pub fn subscribe(&self, id: JobId) -> Option<(u64, UnboundedReceiver<ProgressEvent>)> {
        let mut inner = self.lock();
        let subscriber_id = inner.next_subscriber_id;
        let entry = inner.jobs.get_mut(&id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &entry.history {
            // The receiver is in-hand, so these sends cannot fail.
            let _ = tx.send(event.clone());
        }
        entry.subscribers.push((subscriber_id, tx));
        inner.next_subscriber_id += 1;
        Some((subscriber_id, rx))
    }

    /// Remove a subscriber. Idempotent; no-op on unknown id.
    pub fn unsubscribe(&self, id: JobId, subscriber_id: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(&id) {
            entry.subscribers.retain(|(sid, _)| *sid != subscriber_id);
        }
    }

    /// Claim a completed job's artifact: removes the job and hands back the
    /// artifact path, download file name, and recorded working directory in
    /// one lock acquisition, so exactly one caller can ever win. Returns
    /// `None` when the job is unknown, unfinished, or already claimed.
    pub fn take_artifact(&self, id: JobId) -> Option<(PathBuf, String, Option<PathBuf>)> {
        let mut inner = self.lock();
        let claimable = matches!(
            inner.jobs.get(&id),
            Some(entry) if entry.status == JobStatus::Complete
        );
        if !claimable {
            return None;
        }
        let entry = inner.jobs.remove(&id)?;
        // `complete` always records both; a Complete entry without them
        // cannot be constructed.
        let (Some(path), Some(name)) = (entry.artifact_path, entry.file_name) else {
            return None;
        };
        Some((path, name, entry.work_dir))
    }

    /// Remove the job and best-effort delete its recorded working directory.
    /// Always uses the path recorded on the job, never one re-derived from
    /// the artifact path. No-op on unknown id.
    pub fn delete(&self, id: JobId) {
        let entry = {
            let mut inner = self.lock();
            inner.jobs.remove(&id)
        };
        if let Some(entry) = entry
            && let Some(dir) = entry.work_dir
        {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned store mutex means an emit/subscribe panicked while
        // holding it; the maps are still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
