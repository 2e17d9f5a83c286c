use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{
    fields, format_timestamp, FailureKind, JobRecord, JobResult, JobStatus,
};
use crate::store::{
    claim_next, fail_unreadable, load_record, transition_status, ActiveChange, JobStore,
};
use crate::strategy::{BuildContext, StrategySet};
use crate::worker::executor::ProcessGroups;
use crate::worker::heartbeat::HeartbeatEmitter;
use crate::worker::remove_work_dir;

/// Attempts for a store write whose loss would hide a job's outcome.
const STORE_ATTEMPTS: u32 = 5;
/// First backoff between those attempts; doubles each time.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fixed-size set of worker loops sharing one store and one strategy set.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    strategies: StrategySet,
    config: QueueConfig,
}

/// Running workers. Dropping the handle does not stop them; cancel the shutdown
/// token passed to [`WorkerPool::start`] and then [`join`](PoolHandle::join).
pub struct PoolHandle {
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to finish its in-flight job and exit.
    pub async fn join(self) {
        for (id, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                tracing::error!(worker = id, error = %e, "Worker task ended abnormally");
            }
        }
    }
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, strategies: StrategySet, config: QueueConfig) -> Self {
        Self {
            store,
            strategies,
            config,
        }
    }

    /// Verify configuration and toolchains, then spawn the workers.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` or `ToolchainUnavailable`; no job is touched in that case.
    pub async fn start(self, shutdown: CancellationToken) -> Result<PoolHandle> {
        self.config.validate()?;
        self.strategies.verify().await?;

        let shared = Arc::new(self);
        let workers = (0..shared.config.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    pool: shared.clone(),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            workers = workers.len(),
            kinds = ?shared.strategies.kinds(),
            "Worker pool started"
        );
        Ok(PoolHandle { workers })
    }
}

struct Worker {
    id: usize,
    pool: Arc<WorkerPool>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "Worker started");
        let poll = self.pool.config.poll_interval;

        // Shutdown is only observed between jobs, so an in-flight build drains.
        while !shutdown.is_cancelled() {
            let job_id = match claim_next(self.pool.store.as_ref(), poll).await {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Claim failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => continue,
                    }
                }
            };
            self.process(&job_id).await;
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }

    /// Run a job this worker has already claimed: it is `compiling` and in the active
    /// set, so from here on it ends with a result or is reaped.
    async fn process(&self, job_id: &str) {
        let store = self.pool.store.as_ref();
        let record = match retry_store("load claimed job", || load_record(store, job_id)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(worker = self.id, job_id, "Claimed job has no record");
                if let Err(e) = store.remove_active(job_id).await {
                    tracing::warn!(job_id, error = %e, "Could not drop active entry");
                }
                return;
            }
            Err(QueueError::CorruptRecord { reason, .. }) => {
                tracing::error!(worker = self.id, job_id, reason = %reason, "Failing corrupt job");
                if let Err(e) = fail_unreadable(store, job_id, &reason).await {
                    tracing::error!(job_id, error = %e, "Could not fail corrupt job");
                }
                return;
            }
            Err(e) => {
                // The claim's heartbeat goes stale, so the reaper fails the job.
                tracing::error!(worker = self.id, job_id, error = %e, "Could not load claimed job");
                return;
            }
        };

        tracing::info!(
            worker = self.id,
            job_id = %record.job_id,
            kind = %record.kind,
            lab = %record.lab_name,
            "Job claimed"
        );

        let stop = CancellationToken::new();
        let heartbeat = HeartbeatEmitter::new(self.pool.config.heartbeat_interval).spawn(
            self.pool.store.clone(),
            record.job_id,
            stop.clone(),
        );

        let result = self.run_build(&record).await;

        stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(job_id = %record.job_id, error = %e, "Heartbeat task failed");
        }

        let finished =
            retry_store("record job result", || finish_job(store, &record.job_id, &result)).await;
        match finished {
            Ok(true) => tracing::info!(
                worker = self.id,
                job_id = %record.job_id,
                success = result.success,
                error = ?result.error,
                "Job finished"
            ),
            Ok(false) => tracing::warn!(
                worker = self.id,
                job_id = %record.job_id,
                "Job was already failed by the reaper, discarding result"
            ),
            Err(e) => tracing::error!(
                worker = self.id,
                job_id = %record.job_id,
                error = %e,
                "Failed to record job result"
            ),
        }

        remove_work_dir(&record.request.work_dir).await;
    }

    /// Runs the job's strategy in its own task so a panic is contained, under the
    /// subprocess budget plus a grace period.
    async fn run_build(&self, record: &JobRecord) -> JobResult {
        let Some(strategy) = self.pool.strategies.get(record.kind) else {
            return JobResult::failure(
                FailureKind::UnsupportedKind,
                format!("No {} strategy is configured on this worker pool", record.kind),
            );
        };

        let max_runtime = self.pool.config.max_runtime;
        let processes = ProcessGroups::default();
        let ctx = BuildContext {
            job_id: record.job_id,
            lab_name: record.lab_name.clone(),
            work_dir: record.request.work_dir.clone(),
            spec: record.request.spec.clone(),
            max_runtime,
            processes: processes.clone(),
        };

        let budget = max_runtime + self.pool.config.strategy_grace;
        let mut task = tokio::spawn(async move { strategy.build(&ctx).await });
        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(outcome))) => {
                let published = publish_artifacts(
                    &record.request.work_dir,
                    record.request.publish_dir.as_deref(),
                    &outcome.artifacts,
                )
                .await;
                outcome.into_job_result(published)
            }
            Ok(Ok(Err(e))) => {
                tracing::info!(job_id = %record.job_id, error = %e, "Build precondition failed");
                JobResult::failure(FailureKind::Precondition, e.to_string())
            }
            Ok(Err(e)) => {
                let message = if e.is_panic() {
                    format!("Build strategy panicked: {}", panic_message(e.into_panic()))
                } else {
                    "Build task was cancelled".to_string()
                };
                tracing::error!(job_id = %record.job_id, error = %message, "Build task failed");
                JobResult::failure(FailureKind::Internal, message)
            }
            Err(_) => {
                // Groups go first, while their leaders are still unreaped.
                let killed = processes.kill_all();
                task.abort();
                tracing::error!(
                    job_id = %record.job_id,
                    process_groups = killed,
                    "Build strategy overran its time limit"
                );
                JobResult::failure(
                    FailureKind::Timeout,
                    format!("Build timed out (>{} seconds)", max_runtime.as_secs()),
                )
            }
        }
    }
}

/// `compiling -> complete|failed` with the result, leaving the active set.
/// `false` means someone else (the reaper) already finalized the job.
async fn finish_job(store: &dyn JobStore, job_id: &Uuid, result: &JobResult) -> Result<bool> {
    let status = if result.success {
        JobStatus::Complete
    } else {
        JobStatus::Failed
    };
    transition_status(
        store,
        job_id,
        JobStatus::Compiling,
        status,
        vec![
            (fields::COMPLETED_AT, format_timestamp(&Utc::now())),
            (fields::RESULT, serde_json::to_string(result)?),
        ],
        ActiveChange::Remove,
    )
    .await
}

/// Retry `op` while the store is unreachable, doubling the delay between attempts.
/// Any other error, and the last unavailable one, is returned as is.
async fn retry_store<T, F, Fut>(operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = STORE_RETRY_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(QueueError::StoreUnavailable(reason)) if attempt < STORE_ATTEMPTS => {
                tracing::warn!(operation, attempt, reason = %reason, "Store unavailable, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Copy build outputs out of the working directory before it is deleted.
/// Returns the names that were published.
async fn publish_artifacts(
    work_dir: &Path,
    publish_dir: Option<&Path>,
    artifacts: &[PathBuf],
) -> Vec<String> {
    let Some(dest) = publish_dir else {
        return Vec::new();
    };
    if artifacts.is_empty() {
        return Vec::new();
    }
    if let Err(e) = tokio::fs::create_dir_all(dest).await {
        tracing::warn!(path = %dest.display(), error = %e, "Cannot create publish directory");
        return Vec::new();
    }

    let mut published = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let Some(name) = artifact.file_name() else {
            continue;
        };
        match tokio::fs::copy(work_dir.join(artifact), dest.join(name)).await {
            Ok(_) => published.push(name.to_string_lossy().into_owned()),
            Err(e) => tracing::warn!(
                artifact = %artifact.display(),
                error = %e,
                "Failed to publish build output"
            ),
        }
    }
    published
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
