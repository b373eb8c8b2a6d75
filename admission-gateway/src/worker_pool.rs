use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Immutable request to run a subprocess. Paths are canonicalized and
/// jail-checked by the sandbox before construction.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout_ms: u64,
    pub env: HashMap<String, String>,
    pub max_output_bytes: usize,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no worker or queue slot available")]
    WorkerUnavailable,
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("execution timed out: {0}")]
    ExecTimeout(String),
    #[error("worker crashed while running the job")]
    WorkerCrashed,
    #[error("runner failure: {0}")]
    Runner(String),
}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::WorkerUnavailable => "WORKER_UNAVAILABLE",
            PoolError::ShuttingDown => "POOL_SHUTTING_DOWN",
            PoolError::ExecTimeout(_) => "EXEC_TIMEOUT",
            PoolError::WorkerCrashed => "WORKER_CRASHED",
            PoolError::Runner(_) => "EXEC_FAILED",
        }
    }
}

/// Interactive requests and operator/system tasks never share workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLane {
    Interactive,
    System,
}

impl PoolLane {
    fn index(self) -> usize {
        match self {
            PoolLane::Interactive => 0,
            PoolLane::System => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolLane::Interactive => "interactive",
            PoolLane::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub interactive_workers: usize,
    pub queue_depth: usize,
    /// Fraction of queue capacity past which the per-session fairness
    /// rewrite activates.
    pub fairness_threshold: f64,
    pub hard_timeout_ms: u64,
    pub shutdown_deadline_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            interactive_workers: 2,
            queue_depth: 10,
            fairness_threshold: 0.5,
            hard_timeout_ms: 10_000,
            shutdown_deadline_ms: 15_000,
        }
    }
}

#[derive(Debug)]
pub enum RunnerOutcome {
    Completed(ExecResult),
    Aborted,
    Failed(String),
}

/// Executes one job on behalf of a worker. The abort receiver flips to
/// true when the supervisor posts an abort for the running job.
#[async_trait]
pub trait WorkerRunner: Send + Sync + 'static {
    async fn run(&self, spec: ExecSpec, abort: watch::Receiver<bool>) -> RunnerOutcome;
}

// ---------------- Subprocess runner ----------------

pub struct SubprocessRunner;

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (String, bool) {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let take = n.min(cap - collected.len());
                    collected.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    // keep draining so the child is never blocked on a full pipe
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&collected).into_owned(), truncated)
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl WorkerRunner for SubprocessRunner {
    async fn run(&self, spec: ExecSpec, mut abort: watch::Receiver<bool>) -> RunnerOutcome {
        let started = Instant::now();
        let mut command = Command::new(&spec.binary);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return RunnerOutcome::Failed(format!(
                    "failed to spawn {}: {err}",
                    spec.binary.display()
                ))
            }
        };

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(read_capped(stdout, spec.max_output_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, spec.max_output_bytes));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = aborted(&mut abort) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return RunnerOutcome::Aborted;
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) => RunnerOutcome::Completed(ExecResult {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                truncated: stdout_truncated || stderr_truncated,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(err) => RunnerOutcome::Failed(format!("wait failed: {err}")),
        }
    }
}

// ---------------- Messages ----------------

type JobReply = oneshot::Sender<Result<ExecResult, PoolError>>;

enum PoolCommand {
    Submit {
        lane: PoolLane,
        spec: ExecSpec,
        reply: JobReply,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum PoolEvent {
    Runner {
        worker_id: u64,
        job_id: Uuid,
        outcome: RunnerOutcome,
    },
    WorkerExited {
        worker_id: u64,
    },
    SoftTimeout {
        worker_id: u64,
        job_id: Uuid,
    },
    HardTimeout {
        worker_id: u64,
        job_id: Uuid,
    },
    ShutdownDeadline,
}

enum WorkerCmd {
    Exec { job_id: Uuid, spec: ExecSpec },
    Abort { job_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct LaneStats {
    pub idle_workers: usize,
    pub busy_workers: usize,
    /// Session ids of queued jobs, head first.
    pub queued_sessions: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub interactive: LaneStats,
    pub system: LaneStats,
    pub completed: u64,
    pub crashed: u64,
    pub timed_out: u64,
}

// ---------------- Worker task ----------------

async fn worker_loop(
    worker_id: u64,
    runner: Arc<dyn WorkerRunner>,
    mut rx: mpsc::Receiver<WorkerCmd>,
    events: mpsc::Sender<PoolEvent>,
) {
    while let Some(cmd) = rx.recv().await {
        let WorkerCmd::Exec { job_id, spec } = cmd else {
            // Abort for a job this worker no longer runs: stale, discard.
            continue;
        };
        let (abort_tx, abort_rx) = watch::channel(false);
        let run = AssertUnwindSafe(runner.run(spec, abort_rx)).catch_unwind();
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                cmd = rx.recv() => match cmd {
                    Some(WorkerCmd::Abort { job_id: target }) if target == job_id => {
                        let _ = abort_tx.send(true);
                    }
                    Some(_) => {
                        // Stale abort or unexpected exec while busy: discard.
                    }
                    None => {
                        let _ = abort_tx.send(true);
                    }
                },
            }
        };
        match outcome {
            Ok(outcome) => {
                if events
                    .send(PoolEvent::Runner {
                        worker_id,
                        job_id,
                        outcome,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(_) => {
                let _ = events.send(PoolEvent::WorkerExited { worker_id }).await;
                return;
            }
        }
    }
}

// ---------------- Supervisor ----------------

struct QueuedJob {
    job_id: Uuid,
    spec: ExecSpec,
    reply: JobReply,
}

struct ActiveJob {
    reply: JobReply,
}

struct WorkerSlot {
    worker_id: u64,
    tx: mpsc::Sender<WorkerCmd>,
    join: JoinHandle<()>,
    busy: Option<Uuid>,
    soft_timer: Option<JoinHandle<()>>,
    hard_timer: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn clear_timers(&mut self) {
        if let Some(timer) = self.soft_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.hard_timer.take() {
            timer.abort();
        }
    }
}

struct LaneState {
    lane: PoolLane,
    workers: Vec<WorkerSlot>,
    queue: VecDeque<QueuedJob>,
}

struct Supervisor {
    config: PoolConfig,
    runner: Arc<dyn WorkerRunner>,
    lanes: [LaneState; 2],
    // worker_id -> (lane index, slot index); stale ids resolve to nothing
    worker_index: HashMap<u64, (usize, usize)>,
    active: HashMap<Uuid, ActiveJob>,
    events_tx: mpsc::Sender<PoolEvent>,
    next_worker_id: u64,
    shutting_down: bool,
    shutdown_reply: Option<oneshot::Sender<()>>,
    shutdown_timer: Option<JoinHandle<()>>,
    completed: u64,
    crashed: u64,
    timed_out: u64,
}

impl Supervisor {
    fn spawn_worker(&mut self, lane_idx: usize, slot_idx: Option<usize>) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let (tx, rx) = mpsc::channel(4);
        let join = tokio::spawn(worker_loop(
            worker_id,
            self.runner.clone(),
            rx,
            self.events_tx.clone(),
        ));
        let slot = WorkerSlot {
            worker_id,
            tx,
            join,
            busy: None,
            soft_timer: None,
            hard_timer: None,
        };
        let lane = &mut self.lanes[lane_idx];
        let slot_idx = match slot_idx {
            // Replacement mutates the existing slot; handlers stay wired to
            // the slot, not to the dead worker.
            Some(idx) => {
                let old = std::mem::replace(&mut lane.workers[idx], slot);
                self.worker_index.remove(&old.worker_id);
                old.join.abort();
                idx
            }
            None => {
                lane.workers.push(slot);
                lane.workers.len() - 1
            }
        };
        self.worker_index
            .insert(worker_id, (lane_idx, slot_idx));
    }

    fn handle_submit(&mut self, lane: PoolLane, spec: ExecSpec, reply: JobReply) {
        if self.shutting_down {
            let _ = reply.send(Err(PoolError::ShuttingDown));
            return;
        }
        let job_id = Uuid::new_v4();
        let lane_idx = lane.index();
        let idle_slot = self.lanes[lane_idx]
            .workers
            .iter()
            .position(|slot| slot.busy.is_none());
        match idle_slot {
            Some(slot_idx) => {
                self.dispatch(lane_idx, slot_idx, QueuedJob { job_id, spec, reply });
            }
            None => {
                let queue_len = self.lanes[lane_idx].queue.len();
                if queue_len >= self.config.queue_depth {
                    let _ = reply.send(Err(PoolError::WorkerUnavailable));
                    return;
                }
                let job = QueuedJob { job_id, spec, reply };
                let fairness_active = lane == PoolLane::Interactive
                    && queue_len as f64
                        > self.config.queue_depth as f64 * self.config.fairness_threshold;
                enqueue(&mut self.lanes[lane_idx].queue, job, fairness_active);
            }
        }
    }

    fn dispatch(&mut self, lane_idx: usize, slot_idx: usize, job: QueuedJob) {
        let QueuedJob { job_id, spec, reply } = job;
        let timeout_ms = spec.timeout_ms;
        let lane = self.lanes[lane_idx].lane;
        let events = self.events_tx.clone();
        let slot = &mut self.lanes[lane_idx].workers[slot_idx];
        let worker_id = slot.worker_id;

        if slot.tx.try_send(WorkerCmd::Exec { job_id, spec }).is_err() {
            warn!(worker_id, "worker channel unavailable at dispatch");
            let _ = reply.send(Err(PoolError::WorkerCrashed));
            self.spawn_worker(lane_idx, Some(slot_idx));
            return;
        }

        slot.busy = Some(job_id);
        slot.soft_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = events
                .send(PoolEvent::SoftTimeout { worker_id, job_id })
                .await;
        }));
        self.active.insert(job_id, ActiveJob { reply });
        debug!(worker_id, %job_id, lane = lane.as_str(), "job dispatched");
    }

    fn drain_one(&mut self, lane_idx: usize, slot_idx: usize) {
        if self.shutting_down {
            return;
        }
        if let Some(job) = self.lanes[lane_idx].queue.pop_front() {
            self.dispatch(lane_idx, slot_idx, job);
        }
    }

    fn fail_job(&mut self, job_id: Uuid, error: PoolError) {
        if let Some(job) = self.active.remove(&job_id) {
            let _ = job.reply.send(Err(error));
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Runner {
                worker_id,
                job_id,
                outcome,
            } => {
                let Some(&(lane_idx, slot_idx)) = self.worker_index.get(&worker_id) else {
                    return; // message from a replaced worker
                };
                let slot = &mut self.lanes[lane_idx].workers[slot_idx];
                if slot.busy != Some(job_id) {
                    return; // stale response from aborted prior work
                }
                slot.clear_timers();
                slot.busy = None;
                if let Some(job) = self.active.remove(&job_id) {
                    match outcome {
                        RunnerOutcome::Completed(result) => {
                            self.completed += 1;
                            let _ = job.reply.send(Ok(result));
                        }
                        RunnerOutcome::Aborted => {
                            if self.shutting_down {
                                let _ = job.reply.send(Err(PoolError::ShuttingDown));
                            } else {
                                self.timed_out += 1;
                                let _ = job.reply.send(Err(PoolError::ExecTimeout(
                                    "aborted after soft timeout".into(),
                                )));
                            }
                        }
                        RunnerOutcome::Failed(message) => {
                            let _ = job.reply.send(Err(PoolError::Runner(message)));
                        }
                    }
                }
                self.drain_one(lane_idx, slot_idx);
                self.maybe_finish_shutdown();
            }
            PoolEvent::WorkerExited { worker_id } => {
                let Some(&(lane_idx, slot_idx)) = self.worker_index.get(&worker_id) else {
                    return;
                };
                let busy = {
                    let slot = &mut self.lanes[lane_idx].workers[slot_idx];
                    slot.clear_timers();
                    slot.busy.take()
                };
                if let Some(job_id) = busy {
                    self.crashed += 1;
                    warn!(worker_id, %job_id, "worker crashed while busy");
                    self.fail_job(job_id, PoolError::WorkerCrashed);
                }
                if self.shutting_down {
                    self.worker_index.remove(&worker_id);
                    self.maybe_finish_shutdown();
                } else {
                    self.spawn_worker(lane_idx, Some(slot_idx));
                    self.drain_one(lane_idx, slot_idx);
                }
            }
            PoolEvent::SoftTimeout { worker_id, job_id } => {
                let Some(&(lane_idx, slot_idx)) = self.worker_index.get(&worker_id) else {
                    return;
                };
                let config_hard = self.config.hard_timeout_ms;
                let events = self.events_tx.clone();
                let slot = &mut self.lanes[lane_idx].workers[slot_idx];
                if slot.busy != Some(job_id) {
                    return;
                }
                debug!(worker_id, %job_id, "soft timeout; posting abort");
                let _ = slot.tx.try_send(WorkerCmd::Abort { job_id });
                slot.soft_timer = None;
                slot.hard_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(config_hard)).await;
                    let _ = events
                        .send(PoolEvent::HardTimeout { worker_id, job_id })
                        .await;
                }));
            }
            PoolEvent::HardTimeout { worker_id, job_id } => {
                let Some(&(lane_idx, slot_idx)) = self.worker_index.get(&worker_id) else {
                    return;
                };
                {
                    let slot = &mut self.lanes[lane_idx].workers[slot_idx];
                    if slot.busy != Some(job_id) {
                        return;
                    }
                    slot.clear_timers();
                }
                warn!(worker_id, %job_id, "worker missed abort deadline; terminating");
                self.timed_out += 1;
                self.fail_job(
                    job_id,
                    PoolError::ExecTimeout("worker wedged — terminated and replaced".into()),
                );
                self.spawn_worker(lane_idx, Some(slot_idx));
                if self.shutting_down {
                    self.maybe_finish_shutdown();
                } else {
                    self.drain_one(lane_idx, slot_idx);
                }
            }
            PoolEvent::ShutdownDeadline => {
                if !self.shutting_down {
                    return;
                }
                let busy_jobs: Vec<(usize, usize, Uuid)> = self
                    .lanes
                    .iter()
                    .enumerate()
                    .flat_map(|(lane_idx, lane)| {
                        lane.workers.iter().enumerate().filter_map(move |(idx, slot)| {
                            slot.busy.map(|job_id| (lane_idx, idx, job_id))
                        })
                    })
                    .collect();
                for (lane_idx, slot_idx, job_id) in busy_jobs {
                    let slot = &mut self.lanes[lane_idx].workers[slot_idx];
                    slot.clear_timers();
                    slot.join.abort();
                    slot.busy = None;
                    self.fail_job(job_id, PoolError::ShuttingDown);
                }
                self.finish_shutdown();
            }
        }
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if self.shutting_down {
            let _ = reply.send(());
            return;
        }
        info!("worker pool shutting down");
        self.shutting_down = true;
        self.shutdown_reply = Some(reply);
        for lane in self.lanes.iter_mut() {
            while let Some(job) = lane.queue.pop_front() {
                let _ = job.reply.send(Err(PoolError::ShuttingDown));
            }
            for slot in lane.workers.iter_mut() {
                if let Some(job_id) = slot.busy {
                    let _ = slot.tx.try_send(WorkerCmd::Abort { job_id });
                }
            }
        }
        let deadline = self.config.shutdown_deadline_ms;
        let events = self.events_tx.clone();
        // Safety timer: fires even if a worker never flips back to idle.
        self.shutdown_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(deadline)).await;
            let _ = events.send(PoolEvent::ShutdownDeadline).await;
        }));
        self.maybe_finish_shutdown();
    }

    fn maybe_finish_shutdown(&mut self) {
        if !self.shutting_down {
            return;
        }
        let all_idle = self
            .lanes
            .iter()
            .all(|lane| lane.workers.iter().all(|slot| slot.busy.is_none()));
        if all_idle {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&mut self) {
        if let Some(timer) = self.shutdown_timer.take() {
            timer.abort();
        }
        for lane in self.lanes.iter_mut() {
            for slot in lane.workers.iter_mut() {
                slot.clear_timers();
                slot.join.abort();
            }
        }
        for (_, job) in self.active.drain() {
            let _ = job.reply.send(Err(PoolError::ShuttingDown));
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }

    fn stats(&self) -> PoolStats {
        let lane_stats = |lane: &LaneState| LaneStats {
            idle_workers: lane.workers.iter().filter(|slot| slot.busy.is_none()).count(),
            busy_workers: lane.workers.iter().filter(|slot| slot.busy.is_some()).count(),
            queued_sessions: lane
                .queue
                .iter()
                .map(|job| job.spec.session_id.clone())
                .collect(),
        };
        PoolStats {
            interactive: lane_stats(&self.lanes[0]),
            system: lane_stats(&self.lanes[1]),
            completed: self.completed,
            crashed: self.crashed,
            timed_out: self.timed_out,
        }
    }
}

/// Round-robin fairness rewrite: when the rewrite is active and the new
/// job's session matches the queue tail, the job is inserted just after
/// the first different-session job instead of extending the tail run.
fn enqueue(queue: &mut VecDeque<QueuedJob>, job: QueuedJob, fairness_active: bool) {
    if fairness_active {
        if let (Some(last), Some(session)) = (queue.back(), job.spec.session_id.as_ref()) {
            if last.spec.session_id.as_ref() == Some(session) {
                if let Some(pos) = queue
                    .iter()
                    .position(|queued| queued.spec.session_id.as_ref() != Some(session))
                {
                    queue.insert(pos + 1, job);
                    return;
                }
            }
        }
    }
    queue.push_back(job);
}

async fn supervise(
    mut supervisor: Supervisor,
    mut commands: mpsc::Receiver<PoolCommand>,
    mut events: mpsc::Receiver<PoolEvent>,
) {
    let mut commands_closed = false;
    loop {
        tokio::select! {
            command = commands.recv(), if !commands_closed => match command {
                Some(PoolCommand::Submit { lane, spec, reply }) => {
                    supervisor.handle_submit(lane, spec, reply);
                }
                Some(PoolCommand::Stats { reply }) => {
                    let _ = reply.send(supervisor.stats());
                }
                Some(PoolCommand::Shutdown { reply }) => {
                    supervisor.begin_shutdown(reply);
                }
                None => {
                    commands_closed = true;
                    let (reply, _) = oneshot::channel();
                    supervisor.begin_shutdown(reply);
                }
            },
            event = events.recv() => {
                if let Some(event) = event {
                    supervisor.handle_event(event);
                }
            }
        }
        if supervisor.shutting_down
            && supervisor.shutdown_reply.is_none()
            && supervisor.shutdown_timer.is_none()
        {
            break;
        }
    }
}

/// Cloneable handle; all pool state lives in the supervisor task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    pub fn start(config: PoolConfig, runner: Arc<dyn WorkerRunner>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(128);
        let mut supervisor = Supervisor {
            config: config.clone(),
            runner,
            lanes: [
                LaneState {
                    lane: PoolLane::Interactive,
                    workers: Vec::new(),
                    queue: VecDeque::new(),
                },
                LaneState {
                    lane: PoolLane::System,
                    workers: Vec::new(),
                    queue: VecDeque::new(),
                },
            ],
            worker_index: HashMap::new(),
            active: HashMap::new(),
            events_tx,
            next_worker_id: 0,
            shutting_down: false,
            shutdown_reply: None,
            shutdown_timer: None,
            completed: 0,
            crashed: 0,
            timed_out: 0,
        };
        for _ in 0..config.interactive_workers.max(1) {
            supervisor.spawn_worker(PoolLane::Interactive.index(), None);
        }
        supervisor.spawn_worker(PoolLane::System.index(), None);
        tokio::spawn(supervise(supervisor, cmd_rx, events_rx));
        Self { tx: cmd_tx }
    }

    pub async fn execute(&self, lane: PoolLane, spec: ExecSpec) -> Result<ExecResult, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Submit {
                lane,
                spec,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        reply_rx.await.map_err(|_| PoolError::ShuttingDown)?
    }

    pub async fn stats(&self) -> Option<PoolStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PoolCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}
