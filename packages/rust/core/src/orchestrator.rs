//! The background full-catalog crawl job.
//!
//! At most one job runs at a time. The job runs on its own tokio task and
//! publishes progress through atomic counters; [`BatchOrchestrator::status`]
//! reads either those counters or the last terminal snapshot.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use admitsync_shared::{AdmitError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::{CrawlTotals, Crawler, next_delay};
use crate::reconcile::ReconcileAction;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a full crawl treats institutions that are already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlMode {
    /// Re-crawl stored institutions even when `skip_existing` is set.
    pub force_update: bool,
    pub skip_existing: bool,
}

impl Default for CrawlMode {
    fn default() -> Self {
        Self {
            force_update: false,
            skip_existing: true,
        }
    }
}

impl CrawlMode {
    fn skips(&self, exists: bool) -> bool {
        exists && self.skip_existing && !self.force_update
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time view of the job, live or terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CrawlMode>,
    /// Stubs discovered for this run.
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub totals: CrawlTotals,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn idle() -> Self {
        Self {
            job_id: None,
            status: JobStatus::Idle,
            mode: None,
            total: 0,
            totals: CrawlTotals::default(),
            success_rate: 0.0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Handle to a started job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    task: JoinHandle<JobSnapshot>,
}

impl JobHandle {
    /// Wait for the job to reach a terminal state.
    pub async fn wait(self) -> Result<JobSnapshot> {
        self.task
            .await
            .map_err(|e| AdmitError::Storage(format!("crawl job task failed: {e}")))
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(JobHandle),
    AlreadyRunning,
}

impl StartOutcome {
    /// The new job's handle, or [`AdmitError::Conflict`] when one was already running.
    pub fn into_handle(self) -> Result<JobHandle> {
        match self {
            Self::Started(handle) => Ok(handle),
            Self::AlreadyRunning => Err(AdmitError::Conflict(
                "a crawl job is already running".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared job state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    total: AtomicUsize,
    processed: AtomicUsize,
    created: AtomicUsize,
    updated: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
}

impl Counters {
    fn totals(&self) -> CrawlTotals {
        CrawlTotals {
            processed: self.processed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, action: ReconcileAction) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match action {
            ReconcileAction::Created => self.created.fetch_add(1, Ordering::Relaxed),
            ReconcileAction::Updated => self.updated.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[derive(Debug)]
struct RunningJob {
    job_id: String,
    mode: CrawlMode,
    started_at: DateTime<Utc>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl RunningJob {
    fn snapshot(&self, status: JobStatus, error: Option<String>) -> JobSnapshot {
        let totals = self.counters.totals();
        let finished_at = status.is_terminal().then(Utc::now);
        JobSnapshot {
            job_id: Some(self.job_id.clone()),
            status,
            mode: Some(self.mode),
            total: self.counters.total.load(Ordering::Relaxed),
            success_rate: totals.success_rate(),
            totals,
            error,
            started_at: Some(self.started_at),
            finished_at,
        }
    }
}

#[derive(Debug)]
enum JobState {
    Idle,
    Running(Arc<RunningJob>),
    Finished(JobSnapshot),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Singleton owner of the background crawl job.
pub struct BatchOrchestrator {
    crawler: Arc<Crawler>,
    state: Arc<Mutex<JobState>>,
}

impl BatchOrchestrator {
    pub fn new(crawler: Arc<Crawler>) -> Self {
        Self {
            crawler,
            state: Arc::new(Mutex::new(JobState::Idle)),
        }
    }

    /// Start a full crawl unless one is already running.
    pub fn start(&self, mode: CrawlMode) -> StartOutcome {
        self.launch(mode, |crawler, job| async move { crawl_all(&crawler, &job).await })
    }

    fn launch<F, Fut>(&self, mode: CrawlMode, body: F) -> StartOutcome
    where
        F: FnOnce(Arc<Crawler>, Arc<RunningJob>) -> Fut,
        Fut: Future<Output = Result<JobStatus>> + Send + 'static,
    {
        let mut state = lock(&self.state);
        if matches!(*state, JobState::Running(_)) {
            return StartOutcome::AlreadyRunning;
        }

        let job = Arc::new(RunningJob {
            job_id: Uuid::now_v7().to_string(),
            mode,
            started_at: Utc::now(),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
        });
        *state = JobState::Running(job.clone());
        drop(state);

        info!(job_id = %job.job_id, ?mode, "crawl job started");
        let job_id = job.job_id.clone();
        let body = body(self.crawler.clone(), job.clone());
        let task = tokio::spawn(run_job(self.crawler.clone(), self.state.clone(), job, body));
        StartOutcome::Started(JobHandle { job_id, task })
    }

    /// Live progress, or the last terminal snapshot.
    pub fn status(&self) -> JobSnapshot {
        match &*lock(&self.state) {
            JobState::Idle => JobSnapshot::idle(),
            JobState::Running(job) => job.snapshot(JobStatus::Running, None),
            JobState::Finished(snapshot) => snapshot.clone(),
        }
    }

    /// Like [`status`](Self::status), but an idle orchestrator reports the
    /// most recent finished run from the store.
    pub async fn status_with_history(&self) -> Result<JobSnapshot> {
        let current = self.status();
        if current.status != JobStatus::Idle {
            return Ok(current);
        }
        let Some(run) = self.crawler.storage().latest_crawl_run().await? else {
            return Ok(current);
        };
        Ok(run
            .stats_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or(current))
    }

    /// Request cancellation. Returns whether a job was running.
    pub fn stop(&self) -> bool {
        match &*lock(&self.state) {
            JobState::Running(job) => {
                info!(job_id = %job.job_id, "crawl job cancellation requested");
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.state), JobState::Running(_))
    }

    /// Resolve once no job is running. A finished job has already written
    /// its crawl run record by then.
    pub async fn wait_idle(&self) {
        while self.is_running() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }
}

const IDLE_POLL: Duration = Duration::from_millis(50);

fn lock(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Job body
// ---------------------------------------------------------------------------

/// Record the run, drive `body`, then publish the terminal snapshot. A panic
/// in `body` finishes the job as failed so the orchestrator never stays busy.
#[instrument(skip_all, fields(job_id = %job.job_id))]
async fn run_job<Fut>(
    crawler: Arc<Crawler>,
    state: Arc<Mutex<JobState>>,
    job: Arc<RunningJob>,
    body: Fut,
) -> JobSnapshot
where
    Fut: Future<Output = Result<JobStatus>>,
{
    let storage = crawler.storage().clone();
    let mode_json = serde_json::to_string(&job.mode).unwrap_or_default();
    if let Err(e) = storage.insert_crawl_run(&job.job_id, &mode_json).await {
        warn!(error = %e, "failed to record crawl run");
    }

    let (status, error) = match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(status)) => (status, None),
        Ok(Err(e)) => {
            warn!(error = %e, "crawl job failed");
            (JobStatus::Failed, Some(e.to_string()))
        }
        Err(payload) => {
            let message = format!("crawl job panicked: {}", panic_message(payload.as_ref()));
            error!(%message, "crawl job aborted");
            (JobStatus::Failed, Some(message))
        }
    };

    let snapshot = job.snapshot(status, error);
    info!(
        status = status.as_str(),
        processed = snapshot.totals.processed,
        skipped = snapshot.totals.skipped,
        errors = snapshot.totals.errors,
        success_rate = snapshot.success_rate,
        "crawl job finished"
    );

    let stats_json = serde_json::to_string(&snapshot).unwrap_or_default();
    if let Err(e) = storage
        .finish_crawl_run(&job.job_id, status.as_str(), &stats_json)
        .await
    {
        warn!(error = %e, "failed to finish crawl run record");
    }

    *lock(&state) = JobState::Finished(snapshot.clone());
    snapshot
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Whether the `done`-th item should emit a progress line.
fn progress_due(done: usize, every: usize) -> bool {
    done % every.max(1) == 0
}

/// The per-stub loop. Only discovery and the existence snapshot are fatal.
async fn crawl_all(crawler: &Crawler, job: &RunningJob) -> Result<JobStatus> {
    let stubs = crawler.discover().await?;
    let existing = crawler.storage().existing_codes().await?;
    let counters = &job.counters;
    counters.total.store(stubs.len(), Ordering::Relaxed);

    let pacing = crawler.pacing();
    let count = stubs.len();

    for (i, stub) in stubs.iter().enumerate() {
        if job.cancel.is_cancelled() {
            return Ok(JobStatus::Cancelled);
        }

        let failed = if job.mode.skips(existing.contains(&stub.code)) {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            match crawler.crawl_stub(stub).await {
                Ok(outcome) => {
                    counters.record(outcome.action);
                    Some(false)
                }
                Err(e) => {
                    warn!(code = %stub.code, error = %e, "crawl item failed");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    Some(true)
                }
            }
        };

        let done = i + 1;
        if progress_due(done, pacing.progress_every) {
            let totals = counters.totals();
            info!(
                done,
                total = count,
                processed = totals.processed,
                skipped = totals.skipped,
                errors = totals.errors,
                "crawl progress"
            );
        }

        // Skipped items are not paced.
        let Some(failed) = failed else { continue };
        if done < count {
            tokio::select! {
                _ = job.cancel.cancelled() => return Ok(JobStatus::Cancelled),
                _ = tokio::time::sleep(next_delay(pacing, failed)) => {}
            }
        }
    }

    Ok(JobStatus::Completed)
}
