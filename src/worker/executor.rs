use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bytes of stdout/stderr kept per stream. The rest is drained and dropped so the
/// child never blocks on a full pipe.
const DEFAULT_OUTPUT_LIMIT: usize = 512 * 1024;

/// How long to wait for pipe readers after the process is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How the subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own; `None` when killed by a signal.
    Exited(Option<i32>),
    /// Exceeded the wall-clock budget and was killed together with its process group.
    TimedOut(Duration),
    SpawnFailed(String),
    WaitFailed(String),
}

/// Result of one bounded subprocess run
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub pid: Option<u32>,
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited(Some(0))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut(_))
    }
}

/// Process groups of build subprocesses that have been spawned and not yet reaped.
///
/// Shared between a running strategy and the worker that owns it, so the worker can
/// kill the whole tree if it has to abandon the strategy task. A group is removed as
/// soon as its leader is reaped, after which its id may be reused by the system.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    live: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessGroups {
    fn insert(&self, pgid: u32) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pgid);
    }

    fn remove(&self, pgid: u32) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pgid);
    }

    pub fn is_empty(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// SIGKILL every tracked group. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let groups: Vec<u32> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for pgid in &groups {
            signal_group(Some(*pgid));
        }
        groups.len()
    }
}

/// Runs build tool subprocesses under a hard wall-clock limit.
///
/// The child is placed in its own process group so that a timeout kills everything
/// it spawned (a `make` run forks compilers), not just the direct child. Output is
/// captured concurrently with the wait.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    max_runtime: Duration,
    output_limit: usize,
    groups: ProcessGroups,
}

impl JobExecutor {
    pub fn new(max_runtime: Duration) -> Self {
        Self {
            max_runtime,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            groups: ProcessGroups::default(),
        }
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Record spawned process groups in `groups` until their leader is reaped.
    pub fn with_process_groups(mut self, groups: ProcessGroups) -> Self {
        self.groups = groups;
        self
    }

    pub async fn execute(&self, job_id: Uuid, mut command: Command) -> ExecutionResult {
        let started = Instant::now();
        tracing::info!(
            job_id = %job_id,
            command = ?command.as_std().get_program(),
            max_runtime_secs = self.max_runtime.as_secs(),
            "Starting build process"
        );

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to start build process");
                return ExecutionResult {
                    job_id,
                    pid: None,
                    termination: Termination::SpawnFailed(e.to_string()),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    elapsed: started.elapsed(),
                };
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            self.groups.insert(pid);
        }
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, self.output_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, self.output_limit)));

        let termination = match tokio::time::timeout(self.max_runtime, child.wait()).await {
            Ok(Ok(status)) => Termination::Exited(status.code()),
            Ok(Err(e)) => {
                kill_process_tree(&mut child, pid).await;
                Termination::WaitFailed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    pid = ?pid,
                    limit_secs = self.max_runtime.as_secs(),
                    "Build exceeded its time limit, killing process group"
                );
                kill_process_tree(&mut child, pid).await;
                Termination::TimedOut(self.max_runtime)
            }
        };
        // The leader is reaped from here on, so its group id is no longer ours to signal.
        if let Some(pid) = pid {
            self.groups.remove(pid);
        }

        let stdout = collect_output(stdout).await;
        let stderr = collect_output(stderr).await;
        let exit_code = match termination {
            Termination::Exited(code) => code,
            _ => None,
        };

        tracing::info!(
            job_id = %job_id,
            termination = ?termination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Build process finished"
        );

        ExecutionResult {
            job_id,
            pid,
            termination,
            exit_code,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        }
    }
}

/// Kill the whole group while the leader is still unreaped, then reap it.
async fn kill_process_tree(child: &mut Child, pid: Option<u32>) {
    signal_group(pid);
    let _ = child.start_kill();
    // Reap so no zombie outlives the job.
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        // ESRCH just means the group is already empty.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>) {}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[output truncated]\n");
    }
    text
}

async fn collect_output(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A descendant escaped the process group and still holds the pipe.
            handle.abort();
            String::new()
        }
    }
}
