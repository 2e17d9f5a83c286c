pub mod job;
pub mod queue;
pub mod reaper;

pub use job::{JobRecord, JobResult, JobStatus, JobSubmission, JobView};
pub use queue::{CancelDeclined, CancelOutcome, QueueClient, QueueStats};
pub use reaper::{ReapedJob, Reaper};
