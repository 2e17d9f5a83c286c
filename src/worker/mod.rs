//! Job execution side of the queue.
//!
//! - **Pool**: N worker loops claiming jobs from the shared queue
//! - **Execution**: bounded build subprocesses with process-group kill on timeout
//! - **Heartbeat**: liveness timestamps for the job a worker owns
//!
//! # Components
//!
//! - [`WorkerPool`]: starts the loops after the toolchain check passes
//! - [`JobExecutor`]: runs one subprocess under a wall-clock limit
//! - [`HeartbeatEmitter`]: writes `heartbeat_at` while a build runs
//!
//! # Job flow
//!
//! 1. [`claim_next`](crate::store::claim_next) pops the head, moves it to `compiling`
//!    and into the active set in one store operation
//! 2. The record is loaded; an unreadable one is failed on the spot
//! 3. The heartbeat starts and the job's [`BuildStrategy`](crate::strategy::BuildStrategy) runs
//! 4. Outputs are published, the terminal status and result are written
//! 5. The working directory is deleted whatever the outcome

pub mod executor;
pub mod heartbeat;
pub mod pool;

use std::path::Path;

pub use executor::{JobExecutor, ProcessGroups};
pub use heartbeat::HeartbeatEmitter;
pub use pool::{PoolHandle, WorkerPool};

/// Best-effort removal of a job's working directory.
pub async fn remove_work_dir(path: &Path) {
    if path.as_os_str().is_empty() || path.parent().is_none() {
        tracing::warn!(path = %path.display(), "Refusing to remove working directory");
        return;
    }
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove working directory")
        }
    }
}
