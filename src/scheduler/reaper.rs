use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{fields, format_timestamp, FailureKind, JobResult, JobStatus};
use crate::store::{fail_unreadable, load_record, transition_status, ActiveChange, JobStore};
use crate::worker::remove_work_dir;

/// A job the reaper force-failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedJob {
    pub job_id: Uuid,
    pub reason: String,
}

/// Fails claimed jobs whose owner stopped heartbeating.
///
/// Runs independently of the workers and never takes a worker slot. Several reapers
/// (one per worker process) may sweep concurrently; the status transition decides
/// which of them records the failure.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    interval: Duration,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            interval: config.reaper_interval,
            stale_after: config.stale_after,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            stale_after_secs = self.stale_after.as_secs(),
            "Reaper started"
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                tracing::warn!(error = %e, "Reaper sweep failed");
            }
        }

        tracing::info!("Reaper stopped");
    }

    pub async fn sweep(&self) -> Result<Vec<ReapedJob>> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over the active set, judging staleness against `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<ReapedJob>> {
        let mut reaped = Vec::new();

        for id in self.store.active_ids().await? {
            let record = match load_record(self.store.as_ref(), &id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::warn!(job_id = %id, "Dropping active entry with no record");
                    self.store.remove_active(&id).await?;
                    continue;
                }
                Err(QueueError::CorruptRecord { reason, .. }) => {
                    tracing::error!(job_id = %id, reason = %reason, "Failing corrupt active job");
                    if !fail_unreadable(self.store.as_ref(), &id, &reason).await? {
                        self.store.remove_active(&id).await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if record.status != JobStatus::Compiling {
                tracing::warn!(job_id = %id, status = %record.status, "Dropping active entry for job that is not compiling");
                self.store.remove_active(&id).await?;
                continue;
            }

            let (kind, reason) = match record.heartbeat_at {
                None => (FailureKind::MissingHeartbeat, "Missing heartbeat".to_string()),
                Some(beat) => {
                    let age = (now - beat).to_std().unwrap_or(Duration::ZERO);
                    if age <= self.stale_after {
                        continue;
                    }
                    (
                        FailureKind::StaleHeartbeat,
                        format!("Stale heartbeat: last seen {}s ago", age.as_secs()),
                    )
                }
            };

            let result = JobResult::failure(
                kind,
                format!("{}; the worker running this build stopped responding", reason),
            );
            let applied = transition_status(
                self.store.as_ref(),
                &record.job_id,
                JobStatus::Compiling,
                JobStatus::Failed,
                vec![
                    (fields::COMPLETED_AT, format_timestamp(&now)),
                    (fields::RESULT, serde_json::to_string(&result)?),
                ],
                ActiveChange::Remove,
            )
            .await?;
            if !applied {
                // The owner finished between the read and the transition.
                continue;
            }

            tracing::warn!(job_id = %record.job_id, reason = %reason, "Reaped abandoned job");
            remove_work_dir(&record.request.work_dir).await;
            reaped.push(ReapedJob {
                job_id: record.job_id,
                reason,
            });
        }

        Ok(reaped)
    }
}
