
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use labqueue::error::QueueError;
use labqueue::node::WorkerNode;
use labqueue::scheduler::job::{fields, FailureKind};
use labqueue::scheduler::{JobResult, JobStatus};
use labqueue::store::{ActiveChange, JobStore};
use labqueue::strategy::{BuildKind, StrategySet};
use labqueue::worker::WorkerPool;
use test_harness::{
    assert_eventually, fast_config, strategies, FakeBehavior, FakeStrategy, TestQueue,
};

async fn result_of(queue: &TestQueue, job_id: &uuid::Uuid) -> JobResult {
    queue
        .client
        .status(job_id)
        .await
        .unwrap()
        .unwrap()
        .record
        .result
        .expect("terminal job has a result")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_build_publishes_and_cleans_up() {
    let queue = TestQueue::new(fast_config());
    let publish_dir = queue.root().join("published");
    let mut submission = queue.submission("1042", BuildKind::Compile);
    submission.request.publish_dir = Some(publish_dir.clone());
    let work_dir = submission.request.work_dir.clone();
    let job_id = queue.client.submit(submission).await.unwrap();

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Complete, Duration::from_secs(5))
            .await
    );

    let view = queue.client.status(&job_id).await.unwrap().unwrap();
    assert!(view.record.started_at.is_some());
    assert!(view.record.completed_at.is_some());
    assert!(view.record.heartbeat_at.is_some());
    let result = view.record.result.unwrap();
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "Build complete\n");
    assert_eq!(result.artifacts, vec!["output.bin"]);
    assert_eq!(
        std::fs::read(publish_dir.join("output.bin")).unwrap(),
        b"firmware"
    );

    let work_dir = &work_dir;
    assert_eventually(
        move || async move { !work_dir.exists() },
        Duration::from_secs(2),
        "work dir should be removed after the build",
    )
    .await;
    assert!(queue.store.active_ids().await.unwrap().is_empty());
    assert_eq!(strategy.builds(), 1);

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_build_records_exit_code() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue.submit("1042").await;

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Fail(2));
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(2));
    assert_eq!(result.error_kind, Some(FailureKind::BuildFailed));
    assert!(result.stderr.contains("expected ';'"));
    assert!(result.artifacts.is_empty());

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strategy_panic_is_contained() {
    let queue = TestQueue::new(fast_config());
    let submission = queue.submission("1042", BuildKind::Compile);
    let work_dir = submission.request.work_dir.clone();
    let job_id = queue.client.submit(submission).await.unwrap();
    let next = queue.submit("1043").await;

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Panic);
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert_eq!(result.error_kind, Some(FailureKind::Internal));
    assert!(result.error.unwrap().contains("strategy blew up"));

    // The worker survives and keeps serving the queue.
    assert!(
        queue
            .wait_for_status(&next, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    assert_eq!(strategy.builds(), 2);
    let work_dir = &work_dir;
    assert_eventually(
        move || async move { !work_dir.exists() },
        Duration::from_secs(2),
        "work dir should be removed after a panic",
    )
    .await;

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_precondition_failure() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue.submit("1042").await;

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Precondition);
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert_eq!(result.error_kind, Some(FailureKind::Precondition));
    assert!(result.error.unwrap().contains("mspm0g3507.cmd"));
    assert!(result.exit_code.is_none());

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_kind_fails_job() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue
        .client
        .submit(queue.submission("1042", BuildKind::Drc))
        .await
        .unwrap();

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert_eq!(result.error_kind, Some(FailureKind::UnsupportedKind));
    assert_eq!(strategy.builds(), 0);

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test]
async fn test_missing_toolchain_prevents_start() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue.submit("1042").await;

    let strategy = FakeStrategy::broken(BuildKind::Compile);
    let err = WorkerPool::new(queue.shared_store(), strategies(strategy.clone()), fast_config())
        .start(CancellationToken::new())
        .await
        .err()
        .expect("pool must refuse to start");
    match err {
        QueueError::ToolchainUnavailable(message) => {
            assert!(message.contains("fake compiler not installed"))
        }
        other => panic!("unexpected error: {}", other),
    }

    // No job was touched.
    assert_eq!(queue.status_of(&job_id).await, Some(JobStatus::Queued));
    assert_eq!(queue.store.queued_ids().await.unwrap().len(), 1);
    assert_eq!(strategy.builds(), 0);
}

#[tokio::test]
async fn test_empty_strategy_set_prevents_start() {
    let queue = TestQueue::new(fast_config());
    let result = WorkerPool::new(queue.shared_store(), StrategySet::new(), fast_config())
        .start(CancellationToken::new())
        .await;
    assert!(matches!(result, Err(QueueError::ToolchainUnavailable(_))));
}

#[tokio::test]
async fn test_invalid_config_prevents_start() {
    let queue = TestQueue::new(fast_config());
    let config = fast_config().with_heartbeat(Duration::from_secs(5), Duration::from_secs(1));
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let result = WorkerPool::new(queue.shared_store(), strategies(strategy), config)
        .start(CancellationToken::new())
        .await;
    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_timeout_is_enforced() {
    let queue = TestQueue::new(fast_config().with_max_runtime(Duration::from_secs(1)));
    let job_id = queue.submit("1042").await;

    let strategy = FakeStrategy::new(
        BuildKind::Compile,
        FakeBehavior::Shell("sleep 30".to_string()),
    );
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(8))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert_eq!(result.error_kind, Some(FailureKind::Timeout));
    assert_eq!(result.error.as_deref(), Some("Build timed out (>1 seconds)"));

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_job_is_skipped() {
    let queue = TestQueue::new(fast_config());
    let cancelled = queue.submit("1042").await;
    assert!(queue
        .client
        .cancel(&cancelled, "1042")
        .await
        .unwrap()
        .success());
    // A job cancelled outside the client, so its id is still listed, then a real one.
    let stale = queue.submit("1044").await;
    queue
        .store
        .transition(
            &stale.to_string(),
            JobStatus::Queued.as_str(),
            &[(fields::STATUS, JobStatus::Cancelled.to_string())],
            ActiveChange::Keep,
        )
        .await
        .unwrap();
    let live = queue.submit("1043").await;

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&live, JobStatus::Complete, Duration::from_secs(5))
            .await
    );
    assert_eq!(queue.status_of(&cancelled).await, Some(JobStatus::Cancelled));
    assert_eq!(queue.status_of(&stale).await, Some(JobStatus::Cancelled));
    assert_eq!(strategy.builds(), 1);
    assert!(queue.store.queued_ids().await.unwrap().is_empty());

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_job_is_failed_not_dropped() {
    let queue = TestQueue::new(fast_config());
    queue
        .store
        .enqueue("not-a-job", &[(fields::STATUS, "queued".to_string())])
        .await
        .unwrap();
    let live = queue.submit("1043").await;

    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&live, JobStatus::Complete, Duration::from_secs(5))
            .await
    );
    let raw = queue.store.get_record("not-a-job").await.unwrap();
    assert_eq!(raw[fields::STATUS], "failed");
    assert!(raw[fields::RESULT].contains("could not be read"));
    assert!(queue.store.active_ids().await.unwrap().is_empty());
    assert_eq!(strategy.builds(), 1);

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_survives_brief_store_outage() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue.submit("1042").await;

    let gate = Arc::new(Semaphore::new(0));
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Gate(gate.clone()));
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;
    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Compiling, Duration::from_secs(5))
            .await
    );

    // The build finishes while the store is unreachable.
    queue.store.set_online(false);
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(250)).await;
    queue.store.set_online(true);

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Complete, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert!(result.success);
    assert_eq!(result.stdout, "Build complete\n");
    assert!(queue.store.active_ids().await.unwrap().is_empty());

    shutdown.cancel();
    pool.join().await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overrunning_strategy_has_its_processes_killed() {
    let queue = TestQueue::new(
        fast_config()
            .with_max_runtime(Duration::from_secs(1))
            .with_strategy_grace(Duration::from_millis(300)),
    );
    let job_id = queue.submit("1042").await;
    let pid_file = queue.root().join("sleeper.pid");

    let strategy = FakeStrategy::new(
        BuildKind::Compile,
        FakeBehavior::Runaway(format!(
            "sleep 30 & echo $! > {}; wait",
            pid_file.display()
        )),
    );
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(5))
            .await
    );
    let result = result_of(&queue, &job_id).await;
    assert_eq!(result.error_kind, Some(FailureKind::Timeout));
    assert_eq!(result.error.as_deref(), Some("Build timed out (>1 seconds)"));

    // The backgrounded grandchild went down with the group.
    let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let stat = format!("/proc/{}/stat", pid);
    assert_eventually(
        move || {
            let stat = stat.clone();
            async move {
                match std::fs::read_to_string(&stat) {
                    Err(_) => true,
                    Ok(line) => line
                        .rsplit(')')
                        .next()
                        .map(|rest| rest.trim_start().starts_with('Z'))
                        .unwrap_or(false),
                }
            }
        },
        Duration::from_secs(3),
        "grandchild should be killed when the worker abandons the build",
    )
    .await;

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_in_flight_build() {
    let queue = TestQueue::new(fast_config());
    let running = queue.submit("1042").await;
    let waiting = queue.submit("1043").await;

    let gate = Arc::new(Semaphore::new(0));
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Gate(gate.clone()));
    let (pool, shutdown) = queue.start_pool(strategies(strategy.clone())).await;

    assert!(
        queue
            .wait_for_status(&running, JobStatus::Compiling, Duration::from_secs(5))
            .await
    );
    shutdown.cancel();

    let join = tokio::spawn(pool.join());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!join.is_finished(), "pool must wait for the in-flight build");

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("pool drains after the build finishes")
        .unwrap();

    assert_eq!(queue.status_of(&running).await, Some(JobStatus::Complete));
    // Nothing new is picked up once shutdown is requested.
    assert_eq!(queue.status_of(&waiting).await, Some(JobStatus::Queued));
    assert_eq!(strategy.builds(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_advances_during_build() {
    let queue = TestQueue::new(fast_config());
    let job_id = queue.submit("1042").await;

    let gate = Arc::new(Semaphore::new(0));
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Gate(gate.clone()));
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;

    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Compiling, Duration::from_secs(5))
            .await
    );
    let client = &queue.client;
    let heartbeat = move || async move {
        client
            .status(&job_id)
            .await
            .unwrap()
            .unwrap()
            .record
            .heartbeat_at
    };
    let first = heartbeat().await.expect("claim writes a heartbeat");

    assert_eventually(
        move || async move { heartbeat().await.is_some_and(|beat| beat > first) },
        Duration::from_secs(2),
        "heartbeat should advance while the build runs",
    )
    .await;

    gate.add_permits(1);
    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Complete, Duration::from_secs(5))
            .await
    );
    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_runs_jobs_concurrently() {
    let queue = TestQueue::new(fast_config().with_workers(3));
    let mut jobs = Vec::new();
    for student in ["s1", "s2", "s3"] {
        jobs.push(queue.submit(student).await);
    }

    let gate = Arc::new(Semaphore::new(0));
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Gate(gate.clone()));
    let (pool, shutdown) = queue.start_pool(strategies(strategy)).await;
    assert_eq!(pool.len(), 3);

    let store = &queue.store;
    assert_eventually(
        move || async move { store.active_ids().await.unwrap().len() == 3 },
        Duration::from_secs(5),
        "all three jobs should be compiling at once",
    )
    .await;
    assert_eq!(queue.client.stats().await.unwrap().compiling, 3);

    gate.add_permits(3);
    for job_id in &jobs {
        assert!(
            queue
                .wait_for_status(job_id, JobStatus::Complete, Duration::from_secs(5))
                .await
        );
    }

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_node_runs_pool_and_reaper() {
    let queue = TestQueue::new(fast_config());
    let strategy = FakeStrategy::new(BuildKind::Compile, FakeBehavior::Succeed);
    let node = WorkerNode::new(
        queue.shared_store(),
        strategies(strategy.clone()),
        queue.config.clone(),
    );
    let shutdown = CancellationToken::new();
    let node_task = tokio::spawn(node.run(shutdown.clone()));

    let job_id = queue.submit("1042").await;
    assert!(
        queue
            .wait_for_status(&job_id, JobStatus::Complete, Duration::from_secs(5))
            .await
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), node_task)
        .await
        .expect("node stops after shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(strategy.builds(), 1);
}

#[tokio::test]
async fn test_worker_node_refuses_to_start_without_toolchain() {
    let queue = TestQueue::new(fast_config());
    let node = WorkerNode::new(
        queue.shared_store(),
        strategies(FakeStrategy::broken(BuildKind::Drc)),
        queue.config.clone(),
    );
    let result = node.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(QueueError::ToolchainUnavailable(_))));
}
