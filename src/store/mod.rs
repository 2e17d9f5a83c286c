//! Access to the shared job store.
//!
//! The store is the only state shared between the submitting process and the worker
//! processes. Every mutation is a single atomic store operation, so a `queued` job is
//! always either in the queue list or (once claimed) in the active set:
//! - [`JobStore::enqueue`] writes the record and appends the id together
//! - [`JobStore::claim_head`] pops the head and moves it to the active set together
//! - [`JobStore::dequeue`] removes a queued id and records its new status together
//! - [`JobStore::transition`] checks the job's status and applies fields plus the
//!   active-set change as one step
//!
//! Layout:
//! - `{ns}:job:{id}`: hash holding the flat job record
//! - `{ns}:queue`: list of queued job ids, FIFO (push right, pop left)
//! - `{ns}:active`: set of job ids claimed by a worker

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{
    fields, format_timestamp, FailureKind, JobRecord, JobResult, JobStatus,
};

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// What a status transition does to the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveChange {
    Keep,
    Add,
    Remove,
}

/// Result of one [`JobStore::claim_head`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The queue list is empty.
    Empty,
    /// The head job was moved to the active set with the given fields.
    Claimed(String),
    /// The head id was popped but its job was not in the expected status (cancelled,
    /// missing or already claimed), so it was dropped from the list.
    Discarded(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Write a job hash and append its id to the tail of the queue list, atomically.
    async fn enqueue(&self, job_id: &str, fields: &[(&str, String)]) -> Result<()>;

    /// All fields of a job hash; empty when the job does not exist.
    async fn get_record(&self, job_id: &str) -> Result<HashMap<String, String>>;

    /// If the job's `status` field equals `expected_status`, write `fields` and apply
    /// `active`, atomically. Returns whether the change was applied.
    async fn transition(
        &self,
        job_id: &str,
        expected_status: &str,
        fields: &[(&str, String)],
        active: ActiveChange,
    ) -> Result<bool>;

    /// Pop the head of the queue list and, if its status is `expected_status`, write
    /// `fields` and add it to the active set, all as one step. Never blocks.
    async fn claim_head(
        &self,
        expected_status: &str,
        fields: &[(&str, String)],
    ) -> Result<ClaimAttempt>;

    /// Wait until the queue list may have something to claim, at most `timeout`.
    async fn wait_for_work(&self, timeout: Duration) -> Result<()>;

    /// If the job's status is `expected_status` and its id is in the queue list,
    /// remove the id and write `fields`, atomically. Returns whether it was applied.
    async fn dequeue(
        &self,
        job_id: &str,
        expected_status: &str,
        fields: &[(&str, String)],
    ) -> Result<bool>;

    /// Queue list in FIFO order.
    async fn queued_ids(&self) -> Result<Vec<String>>;

    async fn active_ids(&self) -> Result<Vec<String>>;

    async fn remove_active(&self, job_id: &str) -> Result<bool>;
}

/// Key names inside the store, prefixed so deployments can share one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("labqueue")
    }
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.namespace)
    }

    pub fn active(&self) -> String {
        format!("{}:active", self.namespace)
    }
}

/// Read and decode a job record.
pub async fn load_record(store: &dyn JobStore, job_id: &str) -> Result<Option<JobRecord>> {
    let raw = store.get_record(job_id).await?;
    if raw.is_empty() {
        return Ok(None);
    }
    JobRecord::from_fields(job_id, &raw).map(Some)
}

/// Move a job from `from` to `to`, writing `extra` fields alongside the new status.
///
/// Returns `Ok(false)` when the job is no longer in `from`, which is how every
/// claim/finish/cancel/reap race is resolved: exactly one side observes `true`.
pub async fn transition_status(
    store: &dyn JobStore,
    job_id: &Uuid,
    from: JobStatus,
    to: JobStatus,
    extra: Vec<(&'static str, String)>,
    active: ActiveChange,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(QueueError::Internal(format!(
            "illegal status transition {} -> {} for job {}",
            from, to, job_id
        )));
    }

    let mut updates = Vec::with_capacity(extra.len() + 1);
    updates.push((fields::STATUS, to.to_string()));
    updates.extend(extra);

    store
        .transition(&job_id.to_string(), from.as_str(), &updates, active)
        .await
}

/// Claim the oldest queued job: `queued -> compiling` with `started_at` and a first
/// `heartbeat_at`, moved from the queue list to the active set in one store operation.
///
/// Waits at most `timeout` for a job. Ids whose job is no longer queued are dropped.
pub async fn claim_next(store: &dyn JobStore, timeout: Duration) -> Result<Option<String>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stamp = format_timestamp(&Utc::now());
        let updates = [
            (fields::STATUS, JobStatus::Compiling.to_string()),
            (fields::STARTED_AT, stamp.clone()),
            (fields::HEARTBEAT_AT, stamp),
        ];
        match store
            .claim_head(JobStatus::Queued.as_str(), &updates)
            .await?
        {
            ClaimAttempt::Claimed(job_id) => return Ok(Some(job_id)),
            ClaimAttempt::Discarded(job_id) => {
                tracing::info!(job_id = %job_id, "Popped job is no longer queued, skipping");
                continue;
            }
            ClaimAttempt::Empty => {}
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        store.wait_for_work(remaining).await?;
    }
}

/// Fail a claimed job whose record can no longer be decoded, working on the raw
/// status field. Returns `false` when the job was not `compiling`.
pub async fn fail_unreadable(store: &dyn JobStore, job_id: &str, reason: &str) -> Result<bool> {
    let result = JobResult::failure(
        FailureKind::Internal,
        format!("Job record could not be read: {}", reason),
    );
    store
        .transition(
            job_id,
            JobStatus::Compiling.as_str(),
            &[
                (fields::STATUS, JobStatus::Failed.to_string()),
                (fields::COMPLETED_AT, format_timestamp(&Utc::now())),
                (fields::RESULT, serde_json::to_string(&result)?),
            ],
            ActiveChange::Remove,
        )
        .await
}
