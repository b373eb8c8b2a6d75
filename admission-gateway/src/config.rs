use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub redis_url: String,
    pub database_url: String,
    pub rate_limit_prefix: String,
    pub jwks_url: Option<String>,
    pub issuer_allowlist: Vec<String>,
    /// Base64 process-wide HMAC pepper for API-key lookup hashes.
    pub api_key_pepper: String,
    /// Server secret keying challenge HMACs.
    pub challenge_secret: String,
    pub challenge_amount_micro: i64,
    pub challenge_recipient: String,
    pub challenge_chain_id: u64,
    pub challenge_token: String,
    pub challenge_ttl_secs: i64,
    pub cost_per_request_micro: i64,
    pub receipt_verifier_url: Option<String>,
    pub budget_upstream_url: String,
    pub budget_tenant: String,
    pub budget_poll_interval_ms: u64,
    pub budget_drift_threshold_micro: i64,
    pub budget_headroom_percent: u8,
    pub budget_fail_open_abs_cap_micro: i64,
    pub budget_fail_open_max_duration_ms: i64,
    pub pool_interactive_workers: usize,
    pub pool_queue_depth: usize,
    pub pool_fairness_threshold: f64,
    pub pool_hard_timeout_ms: u64,
    pub pool_shutdown_deadline_ms: u64,
    pub sandbox_enabled: bool,
    pub jail_root: PathBuf,
    pub audit_log_path: PathBuf,
    pub agent_binary: String,
    pub agent_timeout_ms: u64,
    pub agent_max_output_bytes: usize,
    pub jwks_refresh_secs: u64,
    pub key_cache_sweep_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let api_key_pepper =
            env::var("API_KEY_PEPPER").context("API_KEY_PEPPER must be set")?;
        let challenge_secret =
            env::var("CHALLENGE_SECRET").context("CHALLENGE_SECRET must be set")?;
        let challenge_recipient =
            env::var("CHALLENGE_RECIPIENT").context("CHALLENGE_RECIPIENT must be set")?;
        let budget_upstream_url =
            env::var("BUDGET_UPSTREAM_URL").context("BUDGET_UPSTREAM_URL must be set")?;
        let budget_tenant = env::var("BUDGET_TENANT").context("BUDGET_TENANT must be set")?;
        let jail_root = env::var("SANDBOX_JAIL_ROOT").context("SANDBOX_JAIL_ROOT must be set")?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let issuer_allowlist = env::var("JWT_ISSUER_ALLOWLIST")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            host,
            port,
            redis_url,
            database_url,
            rate_limit_prefix: env::var("RATE_LIMIT_PREFIX")
                .unwrap_or_else(|_| "gateway:rate".to_string()),
            jwks_url: env::var("JWT_JWKS_URL").ok(),
            issuer_allowlist,
            api_key_pepper,
            challenge_secret,
            challenge_amount_micro: parse_env("CHALLENGE_AMOUNT_MICRO", 100_000),
            challenge_recipient,
            challenge_chain_id: parse_env("CHALLENGE_CHAIN_ID", 8453),
            challenge_token: env::var("CHALLENGE_TOKEN").unwrap_or_else(|_| "USDC".to_string()),
            challenge_ttl_secs: parse_env("CHALLENGE_TTL_SECONDS", 300),
            cost_per_request_micro: parse_env("COST_PER_REQUEST_MICRO", 100_000),
            receipt_verifier_url: env::var("RECEIPT_VERIFIER_URL").ok(),
            budget_upstream_url,
            budget_tenant,
            budget_poll_interval_ms: parse_env("BUDGET_POLL_INTERVAL_MS", 1_000u64).max(250),
            budget_drift_threshold_micro: parse_env("BUDGET_DRIFT_THRESHOLD_MICRO", 1_000_000),
            budget_headroom_percent: parse_env("BUDGET_HEADROOM_PERCENT", 10u8).min(100),
            budget_fail_open_abs_cap_micro: parse_env(
                "BUDGET_FAIL_OPEN_ABS_CAP_MICRO",
                10_000_000,
            ),
            budget_fail_open_max_duration_ms: parse_env(
                "BUDGET_FAIL_OPEN_MAX_DURATION_MS",
                5 * 60 * 1000,
            ),
            pool_interactive_workers: parse_env("POOL_INTERACTIVE_WORKERS", 2usize).max(1),
            pool_queue_depth: parse_env("POOL_QUEUE_DEPTH", 10usize).max(1),
            pool_fairness_threshold: parse_env("POOL_FAIRNESS_THRESHOLD", 0.5f64),
            pool_hard_timeout_ms: parse_env("POOL_HARD_TIMEOUT_MS", 10_000u64).max(100),
            pool_shutdown_deadline_ms: parse_env("POOL_SHUTDOWN_DEADLINE_MS", 15_000u64),
            sandbox_enabled: env::var("SANDBOX_ENABLED")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            jail_root: PathBuf::from(jail_root),
            audit_log_path: PathBuf::from(
                env::var("AUDIT_LOG_PATH").unwrap_or_else(|_| "gateway-audit.log".to_string()),
            ),
            agent_binary: env::var("AGENT_BINARY").unwrap_or_else(|_| "loa-agent".to_string()),
            agent_timeout_ms: parse_env("AGENT_TIMEOUT_MS", 30_000u64).max(1_000),
            agent_max_output_bytes: parse_env("AGENT_MAX_OUTPUT_BYTES", 1 << 20),
            jwks_refresh_secs: parse_env("JWKS_REFRESH_SECONDS", 300u64).max(60),
            key_cache_sweep_secs: parse_env("KEY_CACHE_SWEEP_SECONDS", 60u64).max(10),
        })
    }
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}
