use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::{fields, format_timestamp, JobStatus};
use crate::store::{ActiveChange, JobStore};

/// Writes `heartbeat_at` for one claimed job until told to stop.
///
/// Each beat is conditional on the job still being `compiling`, so a job the reaper
/// has already failed never gets a fresh heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitter {
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn spawn(
        &self,
        store: Arc<dyn JobStore>,
        job_id: Uuid,
        stop: CancellationToken,
    ) -> JoinHandle<u64> {
        let emitter = self.clone();
        tokio::spawn(async move { emitter.run(store.as_ref(), job_id, stop).await })
    }

    /// Returns the number of heartbeats written.
    pub async fn run(&self, store: &dyn JobStore, job_id: Uuid, stop: CancellationToken) -> u64 {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let key = job_id.to_string();
        let mut beats = 0;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = format_timestamp(&Utc::now());
            match store
                .transition(
                    &key,
                    JobStatus::Compiling.as_str(),
                    &[(fields::HEARTBEAT_AT, now)],
                    ActiveChange::Keep,
                )
                .await
            {
                Ok(true) => {
                    beats += 1;
                    tracing::trace!(job_id = %job_id, beats, "Heartbeat");
                }
                Ok(false) => {
                    tracing::warn!(job_id = %job_id, "Job no longer compiling, stopping heartbeat");
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to write heartbeat");
                }
            }
        }

        beats
    }
}
