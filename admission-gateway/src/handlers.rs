use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use common_auth::{AuthError, EndpointKind, TenantContext};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{AgentError, AgentInvocation};
use crate::api_keys::DebitOutcome;
use crate::app_state::AppState;
use crate::payment::{request_binding, PaymentDecision, ReceiptHeaders};
use crate::personas::Persona;
use crate::rate_limiter::{RateDecision, RateTier};
use crate::sandbox::SandboxError;
use crate::worker_pool::PoolError;

#[derive(Clone, Copy)]
pub struct RequestId(pub Uuid);

pub fn router(state: AppState) -> Router {
    let free_state = state.clone();
    let free = Router::new()
        .route("/health", get(health))
        .route("/llms.txt", get(llms_txt))
        .route("/.well-known/jwks.json", get(jwks_json))
        .layer(middleware::from_fn(move |request, next| {
            let state = free_state.clone();
            async move { free_rate_limit(state, request, next).await }
        }));

    Router::new()
        .merge(free)
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/agent/chat", post(agent_chat))
        .route("/api/v1/invoke", post(invoke))
        .route("/api/v1/keys", post(create_key))
        .route("/api/v1/keys/:key_id", delete(revoke_key))
        .route("/api/v1/keys/:key_id/balance", get(key_balance))
        .route("/admin/jwks/invalidate", post(invalidate_jwks))
        .route("/api/v1/budget/:tenant", get(budget_view))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

// ---------------- Middleware ----------------

async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(Uuid::new_v4);
    request.extensions_mut().insert(RequestId(request_id));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

async fn free_rate_limit(
    state: AppState,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(request.headers());
    let decision = state.rate_limiter.check(RateTier::FreePerIp, &ip).await;
    note_rate_decision(&state, RateTier::FreePerIp, &decision);
    if !decision.allowed {
        return Err(rate_limited(&decision, None));
    }
    Ok(next.run(request).await)
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|value| value.trim().to_string())
        .or_else(|| {
            headers
                .get("X-Real-IP")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "local".to_string())
}

fn note_rate_decision(state: &AppState, tier: RateTier, decision: &RateDecision) {
    state
        .metrics
        .record_rate_decision(tier.as_str(), decision.allowed);
    if decision.degraded {
        state.metrics.rate_limiter_fallback_total.inc();
    }
}

fn rate_limited(decision: &RateDecision, request_id: Option<Uuid>) -> ApiError {
    ApiError::RateLimited {
        retry_after_secs: decision.retry_after_secs.max(1),
        limit: decision.limit,
        remaining: decision.remaining,
        reset_secs: decision.reset_secs,
        request_id,
    }
}

// ---------------- Error mapping ----------------

fn auth_error(err: AuthError, request_id: Uuid) -> ApiError {
    let code = err.code();
    match &err {
        AuthError::JwksDegraded | AuthError::IssuerNotAllowed(_) => ApiError::Forbidden {
            code,
            message: err.to_string(),
            request_id: Some(request_id),
        },
        AuthError::ReplayStore(_)
        | AuthError::JwksFetch(_)
        | AuthError::JwksDecode(_)
        | AuthError::JwksMissingKid
        | AuthError::JwksMissingComponents(_)
        | AuthError::JwksUnsupportedKey { .. }
        | AuthError::KeyParse(_, _) => ApiError::Unavailable {
            code,
            message: err.to_string(),
            request_id: Some(request_id),
            retry_after_secs: None,
        },
        _ => ApiError::Unauthorized {
            code,
            message: err.to_string(),
            request_id: Some(request_id),
        },
    }
}

fn agent_error(err: AgentError, request_id: Uuid) -> ApiError {
    let code = err.code();
    match &err {
        AgentError::Sandbox(SandboxError::Pool(pool_err)) => match pool_err {
            PoolError::WorkerUnavailable => ApiError::Unavailable {
                code,
                message: err.to_string(),
                request_id: Some(request_id),
                retry_after_secs: Some(1),
            },
            PoolError::ExecTimeout(_) | PoolError::WorkerCrashed | PoolError::ShuttingDown => {
                ApiError::Unavailable {
                    code,
                    message: err.to_string(),
                    request_id: Some(request_id),
                    retry_after_secs: None,
                }
            }
            PoolError::Runner(_) => ApiError::Internal {
                code,
                message: err.to_string(),
                request_id: Some(request_id),
            },
        },
        AgentError::Sandbox(SandboxError::Disabled) => ApiError::Unavailable {
            code,
            message: err.to_string(),
            request_id: Some(request_id),
            retry_after_secs: None,
        },
        _ => ApiError::Internal {
            code,
            message: err.to_string(),
            request_id: Some(request_id),
        },
    }
}

// ---------------- Payment decision (C6) ----------------

fn api_key_header(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("X-API-Key").and_then(|value| value.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| token.starts_with(crate::api_keys::KEY_PREFIX))
        .map(str::to_string)
}

fn receipt_headers(headers: &HeaderMap) -> Option<ReceiptHeaders> {
    let receipt = headers
        .get("X-Payment-Receipt")
        .and_then(|value| value.to_str().ok())?;
    let nonce = headers
        .get("X-Payment-Nonce")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    Some(ReceiptHeaders {
        receipt: receipt.to_string(),
        nonce: nonce.to_string(),
    })
}

/// The ordered decision matrix. 401 is emitted only for credential
/// failures, 402 only for payment-required; those two must never swap.
async fn decide_payment(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    method: &str,
    body: &Value,
    request_id: Uuid,
) -> ApiResult<PaymentDecision> {
    let api_key = api_key_header(headers);
    let receipt = receipt_headers(headers);

    if api_key.is_some() && receipt.is_some() {
        state.metrics.record_admission("ambiguous", "rejected");
        return Err(ApiError::BadRequest {
            code: "ambiguous_payment",
            message: "a request may carry either an API key or a payment receipt, not both".into(),
            request_id: Some(request_id),
        });
    }

    if let Some(raw_key) = api_key {
        let validated = state
            .keys
            .validate(&raw_key)
            .await
            .map_err(|err| ApiError::internal(err).with_request_id(request_id))?;
        let Some(key) = validated else {
            state.metrics.record_admission("api_key", "unauthorized");
            return Err(ApiError::Unauthorized {
                code: "API_KEY_INVALID",
                message: "missing, malformed, or revoked API key".into(),
                request_id: Some(request_id),
            });
        };

        let decision = state
            .rate_limiter
            .check(RateTier::ApiKeyDefault, &key.key_id)
            .await;
        note_rate_decision(state, RateTier::ApiKeyDefault, &decision);
        if !decision.allowed {
            state.metrics.record_admission("api_key", "rate_limited");
            return Err(rate_limited(&decision, Some(request_id)));
        }

        let outcome = state
            .keys
            .debit(&key.key_id, request_id, state.cost_per_request_micro)
            .await
            .map_err(|err| ApiError::internal(err).with_request_id(request_id))?;
        match outcome {
            DebitOutcome::Applied { balance_after } | DebitOutcome::Replayed { balance_after } => {
                state.metrics.debit_total.with_label_values(&["applied"]).inc();
                debug!(key_id = %key.key_id, balance_after, "debit applied");
                state.metrics.record_admission("api_key", "admitted");
                Ok(PaymentDecision::ApiKey(key))
            }
            DebitOutcome::InsufficientFunds => {
                state.metrics.debit_total.with_label_values(&["refused"]).inc();
                state.metrics.record_admission("api_key", "payment_required");
                Err(ApiError::PaymentRequired {
                    code: "PAYMENT_REQUIRED",
                    message: "credit balance exhausted".into(),
                    request_id: Some(request_id),
                    upgrade: true,
                    challenge: None,
                })
            }
        }
    } else if let Some(receipt) = receipt {
        let Some(verifier) = &state.receipts else {
            return Err(ApiError::Unavailable {
                code: "RECEIPT_VERIFIER_UNREACHABLE",
                message: "receipt verification is not configured".into(),
                request_id: Some(request_id),
                retry_after_secs: None,
            });
        };
        let binding = request_binding(path, method, body);
        // The verifier's own status maps through: 402 stays payment-required,
        // other 4xx surface as rejection, 5xx as verifier unavailability.
        let verified = verifier.verify(&receipt, &binding).await.map_err(|err| {
            state.metrics.record_admission("receipt", "rejected");
            match err.status {
                402 => ApiError::PaymentRequired {
                    code: "PAYMENT_REQUIRED",
                    message: format!("{}: {}", err.code, err.message),
                    request_id: Some(request_id),
                    upgrade: false,
                    challenge: None,
                },
                status if status >= 500 => ApiError::Unavailable {
                    code: "RECEIPT_VERIFIER_UNREACHABLE",
                    message: format!("{} ({status}): {}", err.code, err.message),
                    request_id: Some(request_id),
                    retry_after_secs: None,
                },
                status => ApiError::BadRequest {
                    code: "RECEIPT_REJECTED",
                    message: format!("{} ({status}): {}", err.code, err.message),
                    request_id: Some(request_id),
                },
            }
        })?;

        let decision = state
            .rate_limiter
            .check(RateTier::X402PerWallet, &verified.payer)
            .await;
        note_rate_decision(state, RateTier::X402PerWallet, &decision);
        if !decision.allowed {
            state.metrics.record_admission("receipt", "rate_limited");
            return Err(rate_limited(&decision, Some(request_id)));
        }
        state.metrics.record_admission("receipt", "admitted");
        Ok(PaymentDecision::Receipt(verified))
    } else {
        let ip = client_ip(headers);
        let decision = state
            .rate_limiter
            .check(RateTier::ChallengePerIp, &ip)
            .await;
        note_rate_decision(state, RateTier::ChallengePerIp, &decision);
        if !decision.allowed {
            return Err(rate_limited(&decision, Some(request_id)));
        }
        let challenge = state.challenge.mint(path, method, body);
        state.metrics.record_admission("anonymous", "challenged");
        Err(ApiError::PaymentRequired {
            code: "PAYMENT_REQUIRED",
            message: "no payment credential presented".into(),
            request_id: Some(request_id),
            upgrade: true,
            challenge: Some(serde_json::to_value(&challenge).unwrap_or(Value::Null)),
        })
    }
}

fn budget_gate(state: &AppState, request_id: Uuid) -> ApiResult<()> {
    if state.budget.should_allow_request() {
        Ok(())
    } else {
        state.metrics.record_admission("budget", "closed");
        Err(ApiError::Unavailable {
            code: "BUDGET_UNAVAILABLE",
            message: "spend reconciliation is fail-closed".into(),
            request_id: Some(request_id),
            retry_after_secs: Some(30),
        })
    }
}

async fn require_jwt(
    state: &AppState,
    headers: &HeaderMap,
    endpoint: EndpointKind,
    request_id: Uuid,
) -> ApiResult<TenantContext> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.starts_with(crate::api_keys::KEY_PREFIX))
        .ok_or(ApiError::Unauthorized {
            code: "JWT_INVALID",
            message: "missing bearer token".into(),
            request_id: Some(request_id),
        })?;
    state
        .validator
        .validate(token, endpoint)
        .await
        .map_err(|err| auth_error(err, request_id))
}

// ---------------- Free endpoints ----------------

async fn health() -> &'static str {
    "ok"
}

async fn llms_txt() -> &'static str {
    "# loa-finn gateway\n\
     Paid agent invocation API. Anonymous calls receive an x402 challenge;\n\
     API keys use the dk_ prefix. See /.well-known/jwks.json for token keys.\n"
}

async fn jwks_json(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({ "keys": state.jwks.raw_keys() }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            ApiError::internal(err).into_response()
        }
    }
}

// ---------------- Paid endpoints ----------------

#[derive(Debug, Deserialize)]
struct ChatRequest {
    token_id: String,
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    personality: Persona,
}

async fn agent_chat(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<ChatResponse>> {
    let request: ChatRequest = serde_json::from_value(body.clone()).map_err(|err| {
        ApiError::bad_request("invalid_body", err.to_string()).with_request_id(request_id)
    })?;
    if request.message.trim().is_empty() {
        return Err(
            ApiError::bad_request("invalid_body", "message must not be empty")
                .with_request_id(request_id),
        );
    }

    // Persona resolution precedes payment; an unknown personality is never billed.
    let persona = state
        .personas
        .persona_for(&request.token_id)
        .ok_or(ApiError::NotFound {
            code: "PERSONALITY_NOT_FOUND",
            request_id: Some(request_id),
        })?;

    let decision = decide_payment(
        &state,
        &headers,
        "/api/v1/agent/chat",
        "POST",
        &body,
        request_id,
    )
    .await?;

    let session_id = match &decision {
        PaymentDecision::ApiKey(key) => Some(key.key_id.clone()),
        PaymentDecision::Receipt(receipt) => Some(receipt.payer.clone()),
        PaymentDecision::Free => None,
    };
    // Last admission step before dispatch.
    budget_gate(&state, request_id)?;
    let reply = state
        .agent
        .invoke(AgentInvocation {
            request_id,
            message: request.message,
            model: request.model,
            max_tokens: request.max_tokens,
            session_id,
        })
        .await
        .map_err(|err| agent_error(err, request_id))?;

    // Best-effort post-response metering; failures are logged, not surfaced.
    state.budget.record_local_spend(state.cost_per_request_micro);
    state
        .metrics
        .exec_duration_seconds
        .observe(reply.duration_ms as f64 / 1000.0);

    Ok(Json(ChatResponse {
        response: reply.text,
        personality: persona,
    }))
}

#[derive(Serialize)]
struct InvokeResponse {
    response: String,
    duration_ms: u64,
}

async fn invoke(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<InvokeResponse>> {
    let context = require_jwt(&state, &headers, EndpointKind::Invoke, request_id).await?;
    let decision = decide_payment(&state, &headers, "/api/v1/invoke", "POST", &body, request_id).await?;
    budget_gate(&state, request_id)?;

    let session_id = Some(format!("{}:{}", context.tenant_id, context.subject));
    let reply = state
        .agent
        .invoke(AgentInvocation {
            request_id,
            message: body.to_string(),
            model: None,
            max_tokens: None,
            session_id,
        })
        .await
        .map_err(|err| agent_error(err, request_id))?;

    state.budget.record_local_spend(state.cost_per_request_micro);
    state
        .metrics
        .exec_duration_seconds
        .observe(reply.duration_ms as f64 / 1000.0);
    debug!(branch = decision.branch(), tenant = %context.tenant_id, "invoke admitted");

    Ok(Json(InvokeResponse {
        response: reply.text,
        duration_ms: reply.duration_ms,
    }))
}

// ---------------- Key lifecycle ----------------

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Serialize)]
struct CreateKeyResponse {
    key_id: String,
    plaintext_key: String,
    message: &'static str,
}

async fn create_key(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(request): Json<CreateKeyRequest>,
) -> ApiResult<Json<CreateKeyResponse>> {
    let context = require_jwt(&state, &headers, EndpointKind::Invoke, request_id).await?;
    let label = request.label.unwrap_or_else(|| "default".to_string());
    let (plaintext, created) = state
        .keys
        .create(&context.tenant_id, &label, 0)
        .await
        .map_err(|err| ApiError::internal(err).with_request_id(request_id))?;
    Ok(Json(CreateKeyResponse {
        key_id: created.key_id,
        plaintext_key: plaintext.render(),
        message: "store this key now; it is not retrievable again",
    }))
}

async fn revoke_key(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = require_jwt(&state, &headers, EndpointKind::Invoke, request_id).await?;
    let owned = state
        .keys
        .repo()
        .find_by_key_id(&key_id)
        .await
        .map_err(|err| ApiError::internal(err).with_request_id(request_id))?
        .filter(|record| record.tenant_id == context.tenant_id);
    if owned.is_none() {
        return Err(ApiError::NotFound {
            code: "KEY_NOT_FOUND",
            request_id: Some(request_id),
        });
    }
    state
        .keys
        .revoke(&key_id)
        .await
        .map_err(|err| ApiError::internal(err).with_request_id(request_id))?;
    Ok(Json(serde_json::json!({ "message": "key revoked" })))
}

async fn key_balance(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let context = require_jwt(&state, &headers, EndpointKind::Invoke, request_id).await?;
    let record = state
        .keys
        .repo()
        .find_by_key_id(&key_id)
        .await
        .map_err(|err| ApiError::internal(err).with_request_id(request_id))?
        .filter(|record| record.tenant_id == context.tenant_id)
        .ok_or(ApiError::NotFound {
            code: "KEY_NOT_FOUND",
            request_id: Some(request_id),
        })?;
    Ok(Json(serde_json::json!({
        "key_id": record.key_id,
        "balance_micro": record.balance_micro.to_string(),
        "revoked": record.revoked,
    })))
}

// ---------------- Admin & budget ----------------

async fn invalidate_jwks(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let context = require_jwt(&state, &headers, EndpointKind::Admin, request_id).await?;
    if !context.has_scope("admin:jwks") {
        return Err(ApiError::Forbidden {
            code: "SCOPE_REQUIRED",
            message: "admin:jwks scope required".into(),
            request_id: Some(request_id),
        });
    }
    state.jwks.invalidate();
    warn!(tenant = %context.tenant_id, subject = %context.subject, "JWKS cache invalidated");
    Ok(Json(serde_json::json!({ "message": "key set invalidated" })))
}

async fn budget_view(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(tenant): Path<String>,
) -> ApiResult<Json<Value>> {
    let context =
        require_jwt(&state, &headers, EndpointKind::ServiceToService, request_id).await?;
    if context.tenant_id != tenant {
        return Err(ApiError::NotFound {
            code: "TENANT_NOT_FOUND",
            request_id: Some(request_id),
        });
    }
    let snapshot = state.budget.snapshot();
    Ok(Json(serde_json::json!({
        "committed_micro": snapshot.upstream_committed_micro.to_string(),
        "reserved_micro": snapshot.upstream_reserved_micro.to_string(),
        "limit_micro": snapshot.upstream_limit_micro.to_string(),
        "window_start": snapshot.window_start,
        "window_end": snapshot.window_end,
        "state": snapshot.state.as_str(),
    })))
}
