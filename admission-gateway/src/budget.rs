use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Admission mode with respect to the authoritative budget service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconState {
    Synced,
    FailOpen,
    FailClosed,
}

impl ReconState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconState::Synced => "SYNCED",
            ReconState::FailOpen => "FAIL_OPEN",
            ReconState::FailClosed => "FAIL_CLOSED",
        }
    }
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget upstream unreachable: {0}")]
    Unreachable(String),
    #[error("budget upstream returned {0}")]
    UpstreamStatus(u16),
    #[error("budget payload invalid: {0}")]
    Payload(String),
}

/// Upstream view; *_micro fields arrive as decimal-string integers to
/// preserve precision across the wire.
#[derive(Debug, Clone)]
pub struct UpstreamBudget {
    pub committed_micro: i64,
    pub reserved_micro: i64,
    pub limit_micro: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[async_trait]
pub trait BudgetUpstream: Send + Sync {
    async fn fetch(&self, tenant: &str) -> Result<UpstreamBudget, BudgetError>;
}

pub struct HttpBudgetUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBudgetUpstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct UpstreamBudgetWire {
    committed_micro: String,
    reserved_micro: String,
    limit_micro: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

fn parse_micro(field: &str, value: &str) -> Result<i64, BudgetError> {
    value
        .parse::<i64>()
        .map_err(|_| BudgetError::Payload(format!("{field}: '{value}' is not an integer")))
}

#[async_trait]
impl BudgetUpstream for HttpBudgetUpstream {
    async fn fetch(&self, tenant: &str) -> Result<UpstreamBudget, BudgetError> {
        let url = format!("{}/api/v1/budget/{tenant}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| BudgetError::Unreachable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BudgetError::UpstreamStatus(response.status().as_u16()));
        }
        let wire: UpstreamBudgetWire = response
            .json()
            .await
            .map_err(|err| BudgetError::Payload(err.to_string()))?;
        Ok(UpstreamBudget {
            committed_micro: parse_micro("committed_micro", &wire.committed_micro)?,
            reserved_micro: parse_micro("reserved_micro", &wire.reserved_micro)?,
            limit_micro: parse_micro("limit_micro", &wire.limit_micro)?,
            window_start: wire.window_start,
            window_end: wire.window_end,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub drift_threshold_micro: i64,
    pub headroom_percent: u8,
    pub fail_open_abs_cap_micro: i64,
    pub fail_open_max_duration_ms: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            drift_threshold_micro: 1_000_000,
            headroom_percent: 10,
            fail_open_abs_cap_micro: 10_000_000,
            fail_open_max_duration_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetSnapshot {
    pub state: ReconState,
    pub local_spend_micro: i64,
    pub upstream_committed_micro: i64,
    pub upstream_reserved_micro: i64,
    pub upstream_limit_micro: i64,
    pub headroom_remaining_micro: i64,
    pub fail_open_started_at_ms: Option<i64>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

struct Inner {
    state: ReconState,
    local_spend: i64,
    upstream_committed: i64,
    upstream_reserved: i64,
    upstream_limit: i64,
    headroom_remaining: i64,
    fail_open_started_at_ms: Option<i64>,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
}

type StateChangeHook = Arc<dyn Fn(ReconState, ReconState, &str) + Send + Sync>;

/// Local reconciliation of spend against the authoritative budget
/// service. Owned by the reconciliation task; the admission path reads
/// atomic snapshots.
pub struct BudgetReconciler {
    inner: Mutex<Inner>,
    upstream: Arc<dyn BudgetUpstream>,
    config: BudgetConfig,
    on_change: Option<StateChangeHook>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl BudgetReconciler {
    pub fn new(upstream: Arc<dyn BudgetUpstream>, config: BudgetConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ReconState::Synced,
                local_spend: 0,
                upstream_committed: 0,
                upstream_reserved: 0,
                upstream_limit: 0,
                headroom_remaining: 0,
                fail_open_started_at_ms: None,
                window_start: None,
                window_end: None,
            }),
            upstream,
            config,
            on_change: None,
        }
    }

    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().expect("budget state poisoned");
        BudgetSnapshot {
            state: inner.state,
            local_spend_micro: inner.local_spend,
            upstream_committed_micro: inner.upstream_committed,
            upstream_reserved_micro: inner.upstream_reserved,
            upstream_limit_micro: inner.upstream_limit,
            headroom_remaining_micro: inner.headroom_remaining,
            fail_open_started_at_ms: inner.fail_open_started_at_ms,
            window_start: inner.window_start,
            window_end: inner.window_end,
        }
    }

    /// Record spend observed locally. In FAIL_OPEN the same amount burns
    /// headroom; headroom only ever decreases while the state holds.
    pub fn record_local_spend(&self, micro: i64) {
        self.record_local_spend_at(micro, now_ms())
    }

    fn record_local_spend_at(&self, micro: i64, at_ms: i64) {
        let transition = {
            let mut inner = self.inner.lock().expect("budget state poisoned");
            inner.local_spend += micro;
            if inner.state == ReconState::FailOpen {
                inner.headroom_remaining = (inner.headroom_remaining - micro).max(0);
                if inner.headroom_remaining == 0 {
                    Some(self.transition(&mut inner, ReconState::FailClosed, "headroom exhausted", at_ms))
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.fire(transition);
    }

    /// Poll the upstream view and reconcile.
    pub async fn poll(&self, tenant: &str) {
        match self.upstream.fetch(tenant).await {
            Ok(view) => self.apply_upstream(view, now_ms()),
            Err(err) => {
                warn!(error = %err, tenant, "budget poll failed");
                self.note_upstream_failure(now_ms());
            }
        }
    }

    fn apply_upstream(&self, view: UpstreamBudget, at_ms: i64) {
        let transition = {
            let mut inner = self.inner.lock().expect("budget state poisoned");
            inner.upstream_committed = view.committed_micro;
            inner.upstream_reserved = view.reserved_micro;
            inner.upstream_limit = view.limit_micro;
            inner.window_start = Some(view.window_start);
            inner.window_end = Some(view.window_end);
            let drift = (inner.local_spend - view.committed_micro).abs();
            match inner.state {
                ReconState::FailOpen | ReconState::FailClosed => {
                    Some(self.transition(&mut inner, ReconState::Synced, "upstream reachable", at_ms))
                }
                ReconState::Synced if drift > self.config.drift_threshold_micro => {
                    Some(self.transition(
                        &mut inner,
                        ReconState::FailOpen,
                        "drift beyond threshold",
                        at_ms,
                    ))
                }
                ReconState::Synced => None,
            }
        };
        self.fire(transition);
    }

    fn note_upstream_failure(&self, at_ms: i64) {
        let transition = {
            let mut inner = self.inner.lock().expect("budget state poisoned");
            if inner.state == ReconState::Synced {
                Some(self.transition(&mut inner, ReconState::FailOpen, "upstream unreachable", at_ms))
            } else {
                None
            }
        };
        self.fire(transition);
    }

    /// Admission gate. FAIL_OPEN admits only while headroom remains and
    /// the mode is younger than its duration cap; the cap check lazily
    /// closes the window.
    pub fn should_allow_request(&self) -> bool {
        self.should_allow_request_at(now_ms())
    }

    fn should_allow_request_at(&self, at_ms: i64) -> bool {
        let (allowed, transition) = {
            let mut inner = self.inner.lock().expect("budget state poisoned");
            match inner.state {
                ReconState::Synced => (true, None),
                ReconState::FailClosed => (false, None),
                ReconState::FailOpen => {
                    let expired = inner
                        .fail_open_started_at_ms
                        .map(|started| at_ms - started >= self.config.fail_open_max_duration_ms)
                        .unwrap_or(false);
                    if expired {
                        let change = self.transition(
                            &mut inner,
                            ReconState::FailClosed,
                            "fail-open duration cap exceeded",
                            at_ms,
                        );
                        (false, Some(change))
                    } else {
                        (inner.headroom_remaining > 0, None)
                    }
                }
            }
        };
        self.fire(transition);
        allowed
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: ReconState,
        reason: &'static str,
        at_ms: i64,
    ) -> (ReconState, ReconState, &'static str) {
        let from = inner.state;
        inner.state = to;
        match to {
            ReconState::FailOpen => {
                let percent_cap =
                    inner.upstream_limit.saturating_mul(self.config.headroom_percent as i64) / 100;
                inner.headroom_remaining = if percent_cap > 0 {
                    percent_cap.min(self.config.fail_open_abs_cap_micro)
                } else {
                    self.config.fail_open_abs_cap_micro
                };
                inner.fail_open_started_at_ms = Some(at_ms);
            }
            ReconState::Synced | ReconState::FailClosed => {
                inner.fail_open_started_at_ms = None;
            }
        }
        (from, to, reason)
    }

    fn fire(&self, transition: Option<(ReconState, ReconState, &'static str)>) {
        if let Some((from, to, reason)) = transition {
            if from == to {
                return;
            }
            info!(from = from.as_str(), to = to.as_str(), reason, "budget state changed");
            if let Some(hook) = &self.on_change {
                hook(from, to, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverUpstream;

    #[async_trait]
    impl BudgetUpstream for NeverUpstream {
        async fn fetch(&self, _tenant: &str) -> Result<UpstreamBudget, BudgetError> {
            Err(BudgetError::Unreachable("test".into()))
        }
    }

    fn reconciler(config: BudgetConfig) -> BudgetReconciler {
        BudgetReconciler::new(Arc::new(NeverUpstream), config)
    }

    fn view(committed: i64, limit: i64) -> UpstreamBudget {
        UpstreamBudget {
            committed_micro: committed,
            reserved_micro: 0,
            limit_micro: limit,
            window_start: Utc::now(),
            window_end: Utc::now(),
        }
    }

    #[test]
    fn upstream_failure_opens_then_recovery_resyncs() {
        let recon = reconciler(BudgetConfig::default());
        recon.note_upstream_failure(0);
        assert_eq!(recon.snapshot().state, ReconState::FailOpen);
        recon.apply_upstream(view(0, 100_000_000), 1_000);
        assert_eq!(recon.snapshot().state, ReconState::Synced);
    }

    #[test]
    fn drift_beyond_threshold_opens() {
        let recon = reconciler(BudgetConfig {
            drift_threshold_micro: 500,
            ..BudgetConfig::default()
        });
        recon.record_local_spend_at(10_000, 0);
        recon.apply_upstream(view(0, 100_000_000), 0);
        assert_eq!(recon.snapshot().state, ReconState::FailOpen);
    }

    #[test]
    fn headroom_decreases_monotonically_and_never_increases() {
        let recon = reconciler(BudgetConfig {
            fail_open_abs_cap_micro: 1_000,
            headroom_percent: 10,
            ..BudgetConfig::default()
        });
        recon.note_upstream_failure(0);
        let start = recon.snapshot().headroom_remaining_micro;
        assert_eq!(start, 1_000);

        let mut last = start;
        for spend in [100, 250, 50, 400] {
            recon.record_local_spend_at(spend, 1);
            let now = recon.snapshot().headroom_remaining_micro;
            assert!(now <= last, "headroom increased: {last} -> {now}");
            last = now;
        }
        assert_eq!(last, 1_000 - 800);
    }

    #[test]
    fn spend_past_headroom_closes() {
        let recon = reconciler(BudgetConfig {
            fail_open_abs_cap_micro: 1_000,
            ..BudgetConfig::default()
        });
        recon.note_upstream_failure(0);
        recon.record_local_spend_at(1_001, 10);
        let snapshot = recon.snapshot();
        assert_eq!(snapshot.state, ReconState::FailClosed);
        assert_eq!(snapshot.headroom_remaining_micro, 0);
        assert!(!recon.should_allow_request_at(20));
    }

    #[test]
    fn fail_open_duration_cap_lazily_closes() {
        let recon = reconciler(BudgetConfig {
            fail_open_max_duration_ms: 1_000,
            ..BudgetConfig::default()
        });
        recon.note_upstream_failure(0);
        assert!(recon.should_allow_request_at(500));
        assert!(!recon.should_allow_request_at(1_500));
        assert_eq!(recon.snapshot().state, ReconState::FailClosed);
    }

    #[test]
    fn transitions_fire_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();
        let recon = reconciler(BudgetConfig::default()).with_state_change_hook(Arc::new(
            move |_from, _to, _reason| {
                hook_fired.fetch_add(1, Ordering::SeqCst);
            },
        ));
        recon.note_upstream_failure(0);
        recon.note_upstream_failure(1);
        recon.note_upstream_failure(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        recon.apply_upstream(view(0, 0), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
