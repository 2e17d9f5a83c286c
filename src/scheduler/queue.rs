use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::scheduler::job::{
    fields, format_timestamp, JobRecord, JobResult, JobStatus, JobSubmission, JobView,
};
use crate::store::{load_record, JobStore};
use crate::worker::remove_work_dir;

/// Why a cancellation request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDeclined {
    NotFound,
    NotOwner,
    /// The job already reached a terminal state.
    NotQueued(JobStatus),
    /// A worker claimed the job; running builds cannot be interrupted.
    AlreadyStarted,
}

impl fmt::Display for CancelDeclined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelDeclined::NotFound => write!(f, "Job not found"),
            CancelDeclined::NotOwner => write!(f, "Job belongs to another student"),
            CancelDeclined::NotQueued(status) => write!(f, "Job is already {}", status),
            CancelDeclined::AlreadyStarted => write!(f, "Job already started compiling"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    Declined(CancelDeclined),
}

impl CancelOutcome {
    pub fn success(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled)
    }

    pub fn message(&self) -> String {
        match self {
            CancelOutcome::Cancelled => "Job cancelled".to_string(),
            CancelOutcome::Declined(reason) => reason.to_string(),
        }
    }
}

/// Counts for the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub compiling: usize,
    /// Configured workers per pool, used by the wait estimate.
    pub workers: usize,
}

/// Producer-side access to the job queue. Cheap to clone; the store is shared.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn JobStore>,
    worker_count: usize,
    per_job_estimate: Duration,
}

impl QueueClient {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            worker_count: config.worker_count.max(1),
            per_job_estimate: config.per_job_estimate,
        }
    }

    /// Whether submissions can currently be accepted.
    pub async fn is_available(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Job store unreachable");
                false
            }
        }
    }

    /// Record a new job and append it to the queue. Never waits on execution.
    pub async fn submit(&self, submission: JobSubmission) -> Result<Uuid> {
        let record = JobRecord::new(submission);
        let job_id = record.job_id.to_string();

        self.store.enqueue(&job_id, &record.to_fields()?).await?;

        tracing::info!(
            job_id = %record.job_id,
            kind = %record.kind,
            student_id = %record.student_id,
            lab = %record.lab_name,
            "Job submitted"
        );
        Ok(record.job_id)
    }

    /// Current view of a job, or `None` if it does not exist.
    pub async fn status(&self, job_id: &Uuid) -> Result<Option<JobView>> {
        let Some(record) = load_record(self.store.as_ref(), &job_id.to_string()).await? else {
            return Ok(None);
        };

        if record.status != JobStatus::Queued {
            return Ok(Some(JobView {
                record,
                position: 0,
                estimated_wait_secs: None,
            }));
        }

        let queued = self.store.queued_ids().await?;
        let position = position_of(&queued, &record.job_id.to_string());
        Ok(Some(self.queued_view(record, position)))
    }

    /// Cancel a job that no worker has picked up yet.
    pub async fn cancel(&self, job_id: &Uuid, owner: &str) -> Result<CancelOutcome> {
        let key = job_id.to_string();
        let Some(record) = load_record(self.store.as_ref(), &key).await? else {
            return Ok(CancelOutcome::Declined(CancelDeclined::NotFound));
        };
        if !record.owned_by(owner) {
            return Ok(CancelOutcome::Declined(CancelDeclined::NotOwner));
        }
        match record.status {
            JobStatus::Queued => {}
            JobStatus::Compiling => {
                return Ok(CancelOutcome::Declined(CancelDeclined::AlreadyStarted));
            }
            other => return Ok(CancelOutcome::Declined(CancelDeclined::NotQueued(other))),
        }

        // Removing the id from the list and recording the cancel are one store step;
        // a worker that claimed the job first leaves nothing to remove.
        let result = JobResult::cancelled(format!("Cancelled by {}", owner));
        let updates = [
            (fields::STATUS, JobStatus::Cancelled.to_string()),
            (fields::COMPLETED_AT, format_timestamp(&Utc::now())),
            (fields::RESULT, serde_json::to_string(&result)?),
        ];
        if !self
            .store
            .dequeue(&key, JobStatus::Queued.as_str(), &updates)
            .await?
        {
            tracing::info!(job_id = %job_id, "Cancel lost the race to a worker");
            return Ok(CancelOutcome::Declined(CancelDeclined::AlreadyStarted));
        }

        remove_work_dir(&record.request.work_dir).await;
        tracing::info!(job_id = %job_id, owner, "Job cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Every queued job (with its position) followed by every job a worker holds.
    pub async fn list_active(&self) -> Result<Vec<JobView>> {
        let queued = self.store.queued_ids().await?;
        let mut views = Vec::with_capacity(queued.len());

        for (idx, id) in queued.iter().enumerate() {
            match load_record(self.store.as_ref(), id).await? {
                Some(record) => views.push(self.queued_view(record, idx + 1)),
                None => tracing::warn!(job_id = %id, "Queued id has no record"),
            }
        }

        let mut active = Vec::new();
        for id in self.store.active_ids().await? {
            if let Some(record) = load_record(self.store.as_ref(), &id).await? {
                active.push(JobView {
                    record,
                    position: 0,
                    estimated_wait_secs: None,
                });
            }
        }
        active.sort_by_key(|view| view.record.started_at);
        views.extend(active);

        Ok(views)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            queued: self.store.queued_ids().await?.len(),
            compiling: self.store.active_ids().await?.len(),
            workers: self.worker_count,
        })
    }

    /// Expected wait for a job at `position` (1-indexed) in the queue.
    pub fn estimate_wait(&self, position: usize) -> Duration {
        let total = self.per_job_estimate.as_secs_f64() * position as f64;
        Duration::from_secs_f64(total / self.worker_count as f64)
    }

    fn queued_view(&self, record: JobRecord, position: usize) -> JobView {
        let estimated_wait_secs = (record.status == JobStatus::Queued)
            .then(|| self.estimate_wait(position).as_secs_f64().ceil() as u64);
        JobView {
            record,
            position,
            estimated_wait_secs,
        }
    }
}

/// 1-indexed position in the queue list, 0 when absent.
fn position_of(queued: &[String], job_id: &str) -> usize {
    queued
        .iter()
        .position(|id| id == job_id)
        .map(|idx| idx + 1)
        .unwrap_or(0)
}
