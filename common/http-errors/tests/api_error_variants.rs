use axum::body::to_bytes;
use axum::response::IntoResponse;
use common_http_errors::ApiError;
use serde_json::Value;

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unauthorized_carries_stable_code() {
    let resp = ApiError::unauthorized("JWT_INVALID", "token verification failed").into_response();
    assert_eq!(resp.status().as_u16(), 401);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "JWT_INVALID");
    let body = body_json(resp).await;
    assert_eq!(body["code"], "JWT_INVALID");
    assert!(body["error"].as_str().unwrap().contains("verification"));
}

#[tokio::test]
async fn payment_required_upgrade_header() {
    let resp = ApiError::PaymentRequired {
        code: "PAYMENT_REQUIRED",
        message: "credits exhausted".into(),
        request_id: None,
        upgrade: true,
        challenge: None,
    }
    .into_response();
    assert_eq!(resp.status().as_u16(), 402);
    assert_eq!(resp.headers().get("X-Payment-Upgrade").unwrap(), "x402");
}

#[tokio::test]
async fn payment_required_embeds_challenge() {
    let challenge = serde_json::json!({"amount": "1000", "nonce": "n"});
    let resp = ApiError::PaymentRequired {
        code: "PAYMENT_REQUIRED",
        message: "payment required".into(),
        request_id: None,
        upgrade: false,
        challenge: Some(challenge),
    }
    .into_response();
    let body = body_json(resp).await;
    assert_eq!(body["challenge"]["amount"], "1000");
}

#[tokio::test]
async fn rate_limited_headers_complete() {
    let resp = ApiError::RateLimited {
        retry_after_secs: 60,
        limit: 60,
        remaining: 0,
        reset_secs: 60,
        request_id: None,
    }
    .into_response();
    assert_eq!(resp.status().as_u16(), 429);
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "60");
    assert_eq!(resp.headers().get("X-RateLimit-Limit").unwrap(), "60");
    assert_eq!(resp.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    assert_eq!(resp.headers().get("X-RateLimit-Reset").unwrap(), "60");
}

#[tokio::test]
async fn ambiguous_payment_is_bad_request() {
    let resp =
        ApiError::bad_request("ambiguous_payment", "both API key and receipt presented")
            .into_response();
    assert_eq!(resp.status().as_u16(), 400);
    let body = body_json(resp).await;
    assert_eq!(body["code"], "ambiguous_payment");
}
