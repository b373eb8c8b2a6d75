use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Circuit breaker around one recurring task's handler.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_after_ms: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_after_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: Option<i64>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at_ms: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a run may proceed now. An open breaker past its reset window
    /// transitions to half-open and admits a single probe.
    pub fn allow_at(&mut self, at_ms: i64) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at_ms
                    .map(|opened| at_ms - opened)
                    .unwrap_or(i64::MAX);
                if elapsed >= self.config.reset_after_ms {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) -> Option<(BreakerState, BreakerState)> {
        let from = self.state;
        self.consecutive_failures = 0;
        self.opened_at_ms = None;
        self.state = BreakerState::Closed;
        (from != self.state).then_some((from, self.state))
    }

    pub fn record_failure_at(&mut self, at_ms: i64) -> Option<(BreakerState, BreakerState)> {
        let from = self.state;
        self.consecutive_failures += 1;
        if self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.config.failure_threshold
        {
            self.state = BreakerState::Open;
            self.opened_at_ms = Some(at_ms);
            self.consecutive_failures = 0;
        }
        (from != self.state).then_some((from, self.state))
    }
}

type TaskHandler =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;
type BreakerHook = Arc<dyn Fn(&'static str, BreakerState, BreakerState) + Send + Sync>;

pub struct TaskSpec {
    pub id: &'static str,
    pub interval: Duration,
    pub jitter: Duration,
    pub handler: TaskHandler,
    pub breaker: BreakerConfig,
}

impl TaskSpec {
    pub fn new<F, Fut>(id: &'static str, interval: Duration, jitter: Duration, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id,
            interval,
            jitter,
            handler: Arc::new(move || Box::pin(handler())),
            breaker: BreakerConfig::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Jittered periodic executor. Each task loop computes the next delay
/// after the current run settles, so a slow handler never stacks runs.
pub struct Scheduler {
    tasks: Vec<TaskSpec>,
    on_breaker_change: Option<BreakerHook>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            on_breaker_change: None,
            shutdown,
        }
    }

    pub fn register(&mut self, task: TaskSpec) {
        self.tasks.push(task);
    }

    pub fn with_breaker_hook(mut self, hook: BreakerHook) -> Self {
        self.on_breaker_change = Some(hook);
        self
    }

    pub fn start(&mut self) {
        for task in self.tasks.drain(..) {
            let mut shutdown = self.shutdown.subscribe();
            let hook = self.on_breaker_change.clone();
            tokio::spawn(async move {
                let mut breaker = CircuitBreaker::new(task.breaker);
                loop {
                    let delay = next_delay(task.interval, task.jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!(task = task.id, "scheduler task stopped");
                                return;
                            }
                        }
                    }
                    let now = Utc::now().timestamp_millis();
                    if !breaker.allow_at(now) {
                        debug!(task = task.id, "run suppressed; breaker open");
                        continue;
                    }
                    let change = match (task.handler)().await {
                        Ok(()) => breaker.record_success(),
                        Err(err) => {
                            warn!(task = task.id, error = %err, "scheduled task failed");
                            breaker.record_failure_at(Utc::now().timestamp_millis())
                        }
                    };
                    if let (Some((from, to)), Some(hook)) = (change, hook.as_ref()) {
                        hook(task.id, from, to);
                    }
                }
            });
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn next_delay(interval: Duration, jitter: Duration) -> Duration {
    let base = interval.as_millis() as i64;
    let jitter_ms = jitter.as_millis() as i64;
    let offset = if jitter_ms > 0 {
        rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
    } else {
        0
    };
    Duration::from_millis((base + offset).max(1000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            reset_after_ms: 1_000,
        });
        assert!(breaker.allow_at(0));
        assert!(breaker.record_failure_at(0).is_none());
        assert!(breaker.record_failure_at(1).is_none());
        let change = breaker.record_failure_at(2).unwrap();
        assert_eq!(change, (BreakerState::Closed, BreakerState::Open));
        assert!(!breaker.allow_at(500));
    }

    #[test]
    fn open_breaker_half_opens_after_reset_and_single_probe_decides() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_after_ms: 1_000,
        });
        breaker.record_failure_at(0);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_at(1_500));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Probe failure slams it shut again.
        breaker.record_failure_at(1_501);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_at(3_000));
        let change = breaker.record_success().unwrap();
        assert_eq!(change, (BreakerState::HalfOpen, BreakerState::Closed));
    }

    #[test]
    fn next_delay_respects_floor_and_jitter_bounds() {
        for _ in 0..50 {
            let delay = next_delay(Duration::from_millis(2_000), Duration::from_millis(500));
            assert!(delay >= Duration::from_millis(1_500));
            assert!(delay <= Duration::from_millis(2_500));
        }
        // Floor of one second regardless of configured interval.
        assert_eq!(
            next_delay(Duration::from_millis(10), Duration::ZERO),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn tasks_run_and_stop_on_shutdown() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let mut scheduler = Scheduler::new();
        scheduler.register(TaskSpec::new(
            "tick",
            Duration::from_millis(0),
            Duration::ZERO,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        scheduler.stop();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1, "task never ran");
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(runs.load(Ordering::SeqCst) <= seen + 1);
    }
}
