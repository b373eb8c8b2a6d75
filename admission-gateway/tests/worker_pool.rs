use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use admission_gateway::worker_pool::{
    ExecResult, ExecSpec, PoolConfig, PoolError, PoolHandle, PoolLane, RunnerOutcome, WorkerRunner,
};
use async_trait::async_trait;
use tokio::sync::watch;

fn spec(binary: &str, payload: &str, timeout_ms: u64, session: Option<&str>) -> ExecSpec {
    ExecSpec {
        binary: PathBuf::from(binary),
        args: vec![payload.to_string()],
        cwd: PathBuf::from("/tmp"),
        timeout_ms,
        env: HashMap::new(),
        max_output_bytes: 1 << 16,
        session_id: session.map(str::to_string),
    }
}

/// Behavior keyed on the spec's binary name:
/// - "sleep": sleeps args[0] ms, honors abort
/// - "wedge": never finishes and ignores abort
/// - "crash": panics the worker
/// - anything else: completes immediately echoing args[0]
struct ScriptedRunner {
    active: AtomicUsize,
    max_active: AtomicUsize,
    completions: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            completions: Mutex::new(Vec::new()),
        })
    }

    fn completions(&self) -> Vec<String> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerRunner for ScriptedRunner {
    async fn run(&self, spec: ExecSpec, mut abort: watch::Receiver<bool>) -> RunnerOutcome {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        let result = match spec.binary.to_str().unwrap_or_default() {
            "sleep" => {
                let ms: u64 = spec.args[0].parse().unwrap_or(10);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        RunnerOutcome::Completed(ExecResult {
                            stdout: spec.args[0].clone(),
                            exit_code: 0,
                            duration_ms: ms,
                            ..ExecResult::default()
                        })
                    }
                    _ = abort.changed() => RunnerOutcome::Aborted,
                }
            }
            "wedge" => {
                // Deliberately deaf to the abort signal.
                std::future::pending::<()>().await;
                unreachable!()
            }
            "crash" => panic!("worker down"),
            _ => RunnerOutcome::Completed(ExecResult {
                stdout: spec.args[0].clone(),
                exit_code: 0,
                ..ExecResult::default()
            }),
        };
        if let RunnerOutcome::Completed(result) = &result {
            self.completions.lock().unwrap().push(result.stdout.clone());
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn config(workers: usize, depth: usize, hard_ms: u64) -> PoolConfig {
    PoolConfig {
        interactive_workers: workers,
        queue_depth: depth,
        fairness_threshold: 0.5,
        hard_timeout_ms: hard_ms,
        shutdown_deadline_ms: 500,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn lanes_bound_concurrency_and_drain_the_queue() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(2, 10, 5_000), runner.clone());

    let started = Instant::now();
    let mut handles = Vec::new();
    for name in ["a", "b", "c"] {
        let pool = pool.clone();
        let job = spec("sleep", "200", 5_000, Some(name));
        handles.push(tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, job).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    // Two workers: the third job waits for a free worker.
    assert_eq!(runner.max_active.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(390));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queue_rejects_with_worker_unavailable() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 1, 5_000), runner);

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "300", 5_000, None))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "10", 5_000, None))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let overflow = pool
        .execute(PoolLane::Interactive, spec("fast", "x", 5_000, None))
        .await;
    match overflow {
        Err(PoolError::WorkerUnavailable) => {}
        other => panic!("expected WorkerUnavailable, got {other:?}"),
    }
    busy.await.unwrap().unwrap();
    queued.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn system_lane_does_not_compete_with_interactive() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 2, 5_000), runner);

    // Saturate the single interactive worker.
    let interactive = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "300", 5_000, None))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A system job runs immediately on its dedicated worker.
    let started = Instant::now();
    pool.execute(PoolLane::System, spec("fast", "sys", 5_000, None))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    interactive.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_session_append_lands_after_the_other_session() {
    // Queue S,S,S,S,T then a new S: the arrival lands after T.
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 10, 5_000), runner.clone());

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "400", 5_000, Some("warm")))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut waiters = Vec::new();
    let submissions = [
        ("s1", "S"),
        ("s2", "S"),
        ("s3", "S"),
        ("s4", "S"),
        ("t1", "T"),
        ("s5", "S"),
    ];
    for (payload, session) in submissions {
        let pool = pool.clone();
        let job = spec("fast", payload, 5_000, Some(session));
        waiters.push(tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, job).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = pool.stats().await.unwrap();
    let queued: Vec<Option<String>> = stats.interactive.queued_sessions;
    assert_eq!(
        queued,
        vec![
            Some("S".to_string()),
            Some("S".to_string()),
            Some("S".to_string()),
            Some("S".to_string()),
            Some("T".to_string()),
            Some("S".to_string()),
        ]
    );

    busy.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn chatty_session_is_interleaved_past_the_fullness_threshold() {
    // Queue T,S,S,S,S with capacity 8 (threshold 4): a new S is inserted
    // after T instead of extending the S run, so it drains second.
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 8, 5_000), runner.clone());

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "400", 5_000, Some("warm")))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut waiters = Vec::new();
    for (payload, session) in [
        ("t1", "T"),
        ("s1", "S"),
        ("s2", "S"),
        ("s3", "S"),
        ("s4", "S"),
        ("s5", "S"),
    ] {
        let pool = pool.clone();
        let job = spec("fast", payload, 5_000, Some(session));
        waiters.push(tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, job).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    busy.await.unwrap().unwrap();

    let completions = runner.completions();
    let drained: Vec<&str> = completions
        .iter()
        .map(String::as_str)
        .filter(|payload| *payload != "400")
        .collect();
    assert_eq!(drained, vec!["t1", "s5", "s1", "s2", "s3", "s4"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_timeout_aborts_a_cooperative_job() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 2, 5_000), runner);

    let result = pool
        .execute(PoolLane::Interactive, spec("sleep", "10000", 50, None))
        .await;
    match result {
        Err(PoolError::ExecTimeout(reason)) => assert!(reason.contains("soft timeout")),
        other => panic!("expected ExecTimeout, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn wedged_worker_is_terminated_and_replaced() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 2, 100), runner);

    let result = pool
        .execute(PoolLane::Interactive, spec("wedge", "x", 50, None))
        .await;
    match result {
        Err(PoolError::ExecTimeout(reason)) => assert!(reason.contains("wedged")),
        other => panic!("expected wedged ExecTimeout, got {other:?}"),
    }

    // The replacement worker accepts the next job.
    let next = pool
        .execute(PoolLane::Interactive, spec("fast", "after", 5_000, None))
        .await
        .unwrap();
    assert_eq!(next.stdout, "after");

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_fails_the_job_and_recovers() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 2, 5_000), runner);

    let result = pool
        .execute(PoolLane::Interactive, spec("crash", "x", 5_000, None))
        .await;
    match result {
        Err(PoolError::WorkerCrashed) => {}
        other => panic!("expected WorkerCrashed, got {other:?}"),
    }

    let next = pool
        .execute(PoolLane::Interactive, spec("fast", "again", 5_000, None))
        .await
        .unwrap();
    assert_eq!(next.stdout, "again");

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.crashed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_rejects_queued_work_and_completes() {
    let runner = ScriptedRunner::new();
    let pool = PoolHandle::start(config(1, 5, 200), runner);

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("sleep", "5000", 10_000, None))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(PoolLane::Interactive, spec("fast", "q", 10_000, None))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown_started = Instant::now();
    pool.shutdown().await;
    assert!(shutdown_started.elapsed() < Duration::from_secs(2));

    match queued.await.unwrap() {
        Err(PoolError::ShuttingDown) => {}
        other => panic!("queued job should be rejected, got {other:?}"),
    }
    match busy.await.unwrap() {
        Err(PoolError::ShuttingDown) => {}
        other => panic!("busy job should be torn down, got {other:?}"),
    }

    // New work after shutdown is refused.
    match pool
        .execute(PoolLane::Interactive, spec("fast", "late", 1_000, None))
        .await
    {
        Err(PoolError::ShuttingDown) => {}
        other => panic!("post-shutdown submit should fail, got {other:?}"),
    }
}
