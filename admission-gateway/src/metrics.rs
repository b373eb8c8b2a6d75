use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry};

#[derive(Clone)]
pub struct GatewayMetrics {
    pub registry: Registry,
    pub admission_total: IntCounterVec,
    pub rate_limit_decisions: IntCounterVec,
    pub rate_limiter_fallback_total: IntCounter,
    pub debit_total: IntCounterVec,
    pub pool_queue_depth: IntGaugeVec,
    pub jwks_state: IntGauge,
    pub budget_state: IntGauge,
    pub budget_headroom_micro: IntGauge,
    pub exec_duration_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let admission_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_admission_total", "Admission outcomes by branch"),
            &["branch", "outcome"],
        )?;
        let rate_limit_decisions = IntCounterVec::new(
            prometheus::Opts::new(
                "gateway_rate_limit_decisions_total",
                "Rate-limit decisions by tier",
            ),
            &["tier", "allowed"],
        )?;
        let rate_limiter_fallback_total = IntCounter::new(
            "gateway_rate_limiter_fallback_total",
            "Requests limited by the in-process fallback limiter",
        )?;
        let debit_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_debit_total", "Credit debits by outcome"),
            &["outcome"],
        )?;
        let pool_queue_depth = IntGaugeVec::new(
            prometheus::Opts::new("gateway_pool_queue_depth", "Queued jobs per lane"),
            &["lane"],
        )?;
        let jwks_state = IntGauge::new(
            "gateway_jwks_state",
            "JWKS health (0=healthy, 1=stale, 2=degraded)",
        )?;
        let budget_state = IntGauge::new(
            "gateway_budget_state",
            "Reconciliation state (0=synced, 1=fail_open, 2=fail_closed)",
        )?;
        let budget_headroom_micro = IntGauge::new(
            "gateway_budget_headroom_micro",
            "Remaining fail-open headroom in micro-units",
        )?;
        let exec_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "gateway_exec_duration_seconds",
                "Wall-clock duration of sandboxed executions",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(admission_total.clone()))?;
        registry.register(Box::new(rate_limit_decisions.clone()))?;
        registry.register(Box::new(rate_limiter_fallback_total.clone()))?;
        registry.register(Box::new(debit_total.clone()))?;
        registry.register(Box::new(pool_queue_depth.clone()))?;
        registry.register(Box::new(jwks_state.clone()))?;
        registry.register(Box::new(budget_state.clone()))?;
        registry.register(Box::new(budget_headroom_micro.clone()))?;
        registry.register(Box::new(exec_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            admission_total,
            rate_limit_decisions,
            rate_limiter_fallback_total,
            debit_total,
            pool_queue_depth,
            jwks_state,
            budget_state,
            budget_headroom_micro,
            exec_duration_seconds,
        })
    }

    pub fn record_admission(&self, branch: &str, outcome: &str) {
        self.admission_total
            .with_label_values(&[branch, outcome])
            .inc();
    }

    pub fn record_rate_decision(&self, tier: &str, allowed: bool) {
        self.rate_limit_decisions
            .with_label_values(&[tier, if allowed { "true" } else { "false" }])
            .inc();
    }

    pub fn render(&self) -> Result<Response, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer))
            .expect("metrics response"))
    }
}
