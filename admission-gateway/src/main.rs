use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_auth::{JwksCache, JwksConfig, JwksFetcher, JwksHealth, JwtValidator, ValidatorConfig};
use common_store::{RedisStore, StateStore};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use admission_gateway::agent::SandboxAgentRuntime;
use admission_gateway::api_keys::{ApiKeyManager, Pepper, PgKeyRepo};
use admission_gateway::app_state::{AppState, StoreJtiStore};
use admission_gateway::audit::AuditLog;
use admission_gateway::budget::{BudgetConfig, BudgetReconciler, HttpBudgetUpstream, ReconState};
use admission_gateway::handlers::router;
use admission_gateway::metrics::GatewayMetrics;
use admission_gateway::payment::{ChallengeSigner, HttpReceiptVerifier};
use admission_gateway::personas::CatalogPersonaSource;
use admission_gateway::rate_limiter::RateLimiter;
use admission_gateway::sandbox::{default_policies, SandboxExecutor, SecretRedactor};
use admission_gateway::scheduler::{Scheduler, TaskSpec};
use admission_gateway::worker_pool::{PoolConfig, PoolHandle, PoolLane, SubprocessRunner};
use admission_gateway::GatewayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    let metrics = Arc::new(GatewayMetrics::new().context("failed to build metrics")?);

    let store: Arc<dyn StateStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to the state store")?,
    );
    let db_pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    let jwks = Arc::new(match &config.jwks_url {
        Some(url) => {
            info!(jwks_url = %url, "configuring JWKS fetcher");
            JwksCache::new(JwksFetcher::new(url.clone()), JwksConfig::default())
        }
        None => {
            warn!("no JWT_JWKS_URL configured; token validation will stay degraded");
            JwksCache::static_only(JwksConfig::default())
        }
    });
    if jwks.refresh().await.is_ok() {
        info!(keys = jwks.key_count(), "initial JWKS fetch complete");
    }

    let validator = Arc::new(JwtValidator::new(
        jwks.clone(),
        Arc::new(StoreJtiStore::new(store.clone())),
        ValidatorConfig::new(config.issuer_allowlist.clone()),
    ));

    let pepper = Pepper::from_base64(&config.api_key_pepper)
        .context("API_KEY_PEPPER must be base64 of at least 16 bytes")?;
    let keys = Arc::new(ApiKeyManager::new(
        Arc::new(PgKeyRepo::new(db_pool.clone())),
        pepper,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        store.clone(),
        config.rate_limit_prefix.clone(),
    ));

    let pool = PoolHandle::start(
        PoolConfig {
            interactive_workers: config.pool_interactive_workers,
            queue_depth: config.pool_queue_depth,
            fairness_threshold: config.pool_fairness_threshold,
            hard_timeout_ms: config.pool_hard_timeout_ms,
            shutdown_deadline_ms: config.pool_shutdown_deadline_ms,
        },
        Arc::new(SubprocessRunner),
    );

    let sandbox = Arc::new(SandboxExecutor::new(
        config.sandbox_enabled,
        &config.jail_root,
        default_policies(&config.agent_binary),
        AuditLog::new(config.audit_log_path.clone()),
        pool.clone(),
        SecretRedactor::new(vec![
            config.api_key_pepper.clone(),
            config.challenge_secret.clone(),
        ]),
        config.agent_timeout_ms,
        config.agent_max_output_bytes,
    )
    .context("failed to initialise the sandbox")?);

    let budget_metrics = metrics.clone();
    let budget = Arc::new(
        BudgetReconciler::new(
            Arc::new(HttpBudgetUpstream::new(config.budget_upstream_url.clone())),
            BudgetConfig {
                drift_threshold_micro: config.budget_drift_threshold_micro,
                headroom_percent: config.budget_headroom_percent,
                fail_open_abs_cap_micro: config.budget_fail_open_abs_cap_micro,
                fail_open_max_duration_ms: config.budget_fail_open_max_duration_ms,
            },
        )
        .with_state_change_hook(Arc::new(move |_from, to, _reason| {
            budget_metrics.budget_state.set(match to {
                ReconState::Synced => 0,
                ReconState::FailOpen => 1,
                ReconState::FailClosed => 2,
            });
        })),
    );

    let challenge = Arc::new(ChallengeSigner::new(
        config.challenge_secret.as_bytes().to_vec(),
        config.challenge_amount_micro,
        config.challenge_recipient.clone(),
        config.challenge_chain_id,
        config.challenge_token.clone(),
        config.challenge_ttl_secs,
    ));

    let state = AppState {
        store: store.clone(),
        jwks: jwks.clone(),
        validator,
        rate_limiter,
        keys: keys.clone(),
        receipts: config.receipt_verifier_url.as_ref().map(|url| {
            Arc::new(HttpReceiptVerifier::new(url.clone()))
                as Arc<dyn admission_gateway::payment::ReceiptVerifier>
        }),
        challenge,
        budget: budget.clone(),
        agent: Arc::new(SandboxAgentRuntime::new(
            sandbox.clone(),
            config.agent_binary.clone(),
        )),
        personas: Arc::new(CatalogPersonaSource),
        pool: pool.clone(),
        metrics: metrics.clone(),
        cost_per_request_micro: config.cost_per_request_micro,
    };

    let mut scheduler = Scheduler::new();
    {
        let budget = budget.clone();
        let tenant = config.budget_tenant.clone();
        let metrics = metrics.clone();
        scheduler.register(TaskSpec::new(
            "budget_poll",
            Duration::from_millis(config.budget_poll_interval_ms),
            Duration::from_millis(config.budget_poll_interval_ms / 10),
            move || {
                let budget = budget.clone();
                let tenant = tenant.clone();
                let metrics = metrics.clone();
                async move {
                    budget.poll(&tenant).await;
                    metrics
                        .budget_headroom_micro
                        .set(budget.snapshot().headroom_remaining_micro);
                    Ok(())
                }
            },
        ));
    }
    {
        let jwks = jwks.clone();
        let metrics = metrics.clone();
        scheduler.register(TaskSpec::new(
            "jwks_refresh",
            Duration::from_secs(config.jwks_refresh_secs),
            Duration::from_secs(config.jwks_refresh_secs / 10),
            move || {
                let jwks = jwks.clone();
                let metrics = metrics.clone();
                async move {
                    let refreshed = jwks.refresh().await;
                    metrics.jwks_state.set(match jwks.health() {
                        JwksHealth::Healthy => 0,
                        JwksHealth::Stale => 1,
                        JwksHealth::Degraded => 2,
                    });
                    refreshed.map(|_| ()).map_err(anyhow::Error::from)
                }
            },
        ));
    }
    {
        let keys = keys.clone();
        scheduler.register(TaskSpec::new(
            "key_cache_sweep",
            Duration::from_secs(config.key_cache_sweep_secs),
            Duration::from_secs(config.key_cache_sweep_secs / 10),
            move || {
                let keys = keys.clone();
                async move {
                    keys.sweep_cache().await;
                    Ok(())
                }
            },
        ));
    }
    {
        let pool = pool.clone();
        let metrics = metrics.clone();
        scheduler.register(TaskSpec::new(
            "pool_gauges",
            Duration::from_secs(5),
            Duration::from_secs(1),
            move || {
                let pool = pool.clone();
                let metrics = metrics.clone();
                async move {
                    if let Some(stats) = pool.stats().await {
                        metrics
                            .pool_queue_depth
                            .with_label_values(&[PoolLane::Interactive.as_str()])
                            .set(stats.interactive.queued_sessions.len() as i64);
                        metrics
                            .pool_queue_depth
                            .with_label_values(&[PoolLane::System.as_str()])
                            .set(stats.system.queued_sessions.len() as i64);
                    }
                    Ok(())
                }
            },
        ));
    }
    scheduler.start();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(state).layer(cors);
    let ip: std::net::IpAddr = config.host.parse().context("invalid HOST")?;
    let addr = SocketAddr::from((ip, config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admission gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    scheduler.stop();
    pool.shutdown().await;
    info!("admission gateway stopped");
    Ok(())
}
