use std::time::Duration;

use tokio::process::Command;
use uuid::Uuid;

use labqueue::worker::executor::{ExecutionResult, JobExecutor, ProcessGroups, Termination};

/// Create a test executor with a generous budget
fn test_executor() -> JobExecutor {
    JobExecutor::new(Duration::from_secs(10))
}

fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

async fn run(executor: &JobExecutor, script: &str) -> (Uuid, ExecutionResult) {
    let job_id = Uuid::new_v4();
    let result = executor.execute(job_id, shell(script)).await;
    (job_id, result)
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (job_id, result) = run(&test_executor(), "echo hello").await;

    assert_eq!(result.job_id, job_id);
    assert!(result.succeeded());
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello\n");
    assert!(result.stderr.is_empty());
    assert!(result.pid.is_some());
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (_, result) = run(&test_executor(), "true").await;

    assert!(result.succeeded());
    assert!(result.stdout.is_empty());
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (_, result) = run(&test_executor(), "seq 1 1000").await;

    assert!(result.succeeded());
    assert_eq!(result.stdout.lines().count(), 1000);
    assert_eq!(result.stdout.lines().last(), Some("1000"));
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (_, result) = run(&test_executor(), "exit 3").await;

    assert!(!result.succeeded());
    assert_eq!(result.termination, Termination::Exited(Some(3)));
    assert_eq!(result.exit_code, Some(3));
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let (_, result) = run(&test_executor(), "echo 'undefined symbol' >&2 && exit 1").await;

    assert!(!result.succeeded());
    assert_eq!(result.stderr, "undefined symbol\n");
    assert!(result.stdout.is_empty());
}

#[tokio::test]
async fn test_execute_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lab3.c"), "int main(void) { return 0; }\n").unwrap();

    let mut command = shell("ls");
    command.current_dir(dir.path());
    let result = test_executor().execute(Uuid::new_v4(), command).await;

    assert!(result.succeeded());
    assert_eq!(result.stdout.trim(), "lab3.c");
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let command = Command::new("/nonexistent/armclang");
    let result = test_executor().execute(Uuid::new_v4(), command).await;

    assert!(matches!(result.termination, Termination::SpawnFailed(_)));
    assert!(result.pid.is_none());
    assert!(result.exit_code.is_none());
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn test_output_is_truncated_at_limit() {
    let executor = test_executor().with_output_limit(64);
    let (_, result) = run(&executor, "seq 1 10000").await;

    assert!(result.succeeded());
    assert!(result.stdout.starts_with("1\n2\n3\n"));
    assert!(result.stdout.ends_with("[output truncated]\n"));
    assert!(result.stdout.len() < 128);
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let executor = JobExecutor::new(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let (_, result) = run(&executor, "echo started; sleep 30").await;

    assert!(result.timed_out());
    assert_eq!(
        result.termination,
        Termination::TimedOut(Duration::from_millis(300))
    );
    assert!(result.exit_code.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_grandchildren() {
    let executor = JobExecutor::new(Duration::from_millis(500));
    // The shell backgrounds a sleeper and reports its pid before blocking on it.
    let (_, result) = run(&executor, "sleep 30 & echo $!; wait").await;
    assert!(result.timed_out());

    let grandchild: u32 = result.stdout.trim().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", grandchild));
    match stat {
        Err(_) => {}
        Ok(stat) => {
            // Reparented to init and not yet reaped.
            let state = stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next());
            assert_eq!(state, Some("Z"), "grandchild still alive: {}", stat);
        }
    }
}

#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => false,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state != "Z")
            .unwrap_or(false),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_normal_exit_does_not_signal_the_group() {
    // The leader exits at once; a helper it left behind keeps the group alive. Once the
    // leader is reaped its id is not ours, so nothing is sent to that group.
    let (_, result) = run(&test_executor(), "sleep 30 >/dev/null 2>&1 & echo $!").await;
    assert!(result.succeeded());

    let helper: u32 = result.stdout.trim().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alive = is_running(helper);
    // Clean up before asserting so a failure does not leak the sleeper.
    let _ = std::process::Command::new("kill")
        .arg("-9")
        .arg(helper.to_string())
        .status();
    assert!(alive, "helper {} was killed after a normal exit", helper);
}

#[tokio::test]
async fn test_process_groups_are_tracked_until_reaped() {
    let groups = ProcessGroups::default();
    let executor = test_executor().with_process_groups(groups.clone());

    let job_id = Uuid::new_v4();
    let running = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.execute(job_id, shell("sleep 0.3")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!groups.is_empty());

    let result = running.await.unwrap();
    assert!(result.succeeded());
    assert!(groups.is_empty());
    assert_eq!(groups.kill_all(), 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_kill_all_stops_an_abandoned_execution() {
    let groups = ProcessGroups::default();
    let executor = test_executor().with_process_groups(groups.clone());
    let pid_file = tempfile::NamedTempFile::new().unwrap();
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.path().display());

    let job_id = Uuid::new_v4();
    let running = tokio::spawn(async move { executor.execute(job_id, shell(&script)).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // What the worker does when it gives up on a strategy task.
    assert_eq!(groups.kill_all(), 1);
    running.abort();
    let _ = running.await;

    let helper: u32 = std::fs::read_to_string(pid_file.path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_running(helper), "helper {} survived", helper);
}
