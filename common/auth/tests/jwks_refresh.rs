use common_auth::{AuthError, JwksCache, JwksConfig, JwksFetcher, JwksHealth};
use httpmock::MockServer;
use serde_json::json;

const TEST_X: &str = "0Z-X0vyUke04atH7hNmB7hAwBdHiQ6mdKR9I9mNaNhg";
const TEST_Y: &str = "sZQpSLUU9W6miIqaoUidm1e4ltx-e653KPIehMr4a54";

fn fast_config() -> JwksConfig {
    JwksConfig {
        min_refresh_interval_ms: 0,
        ..JwksConfig::default()
    }
}

#[tokio::test]
async fn fetch_installs_keys_and_reports_healthy() {
    let server = MockServer::start_async().await;
    let jwks = server
        .mock_async(|when, then| {
            when.method("GET").path("/jwks");
            then.status(200).json_body(json!({
                "keys": [{
                    "kid": "k-2025",
                    "kty": "EC",
                    "crv": "P-256",
                    "alg": "ES256",
                    "x": TEST_X,
                    "y": TEST_Y
                }]
            }));
        })
        .await;

    let cache = JwksCache::new(JwksFetcher::new(server.url("/jwks")), fast_config());
    assert_eq!(cache.health(), JwksHealth::Degraded);

    let count = cache.refresh().await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(cache.health(), JwksHealth::Healthy);
    assert!(cache.lookup("k-2025").is_some());
    assert_eq!(cache.raw_keys().len(), 1);
    jwks.assert_async().await;
}

#[tokio::test]
async fn circuit_opens_after_consecutive_failures() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method("GET").path("/jwks");
            then.status(502);
        })
        .await;

    let cache = JwksCache::new(JwksFetcher::new(server.url("/jwks")), fast_config());

    for _ in 0..5 {
        match cache.refresh().await {
            Err(AuthError::JwksFetch(_)) => {}
            other => panic!("expected fetch failure, got {other:?}"),
        }
    }
    assert_eq!(failing.hits_async().await, 5);

    // Circuit is open: the next refresh returns the cached set without a call.
    cache.refresh().await.unwrap();
    assert_eq!(failing.hits_async().await, 5);
}

#[tokio::test]
async fn non_ec_keys_are_rejected() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/jwks");
            then.status(200).json_body(json!({
                "keys": [{"kid": "rsa-1", "kty": "RSA", "n": "abc", "e": "AQAB"}]
            }));
        })
        .await;

    let cache = JwksCache::new(JwksFetcher::new(server.url("/jwks")), fast_config());
    match cache.refresh().await {
        Err(AuthError::JwksUnsupportedKey { kid, .. }) => assert_eq!(kid, "rsa-1"),
        other => panic!("expected unsupported-key error, got {other:?}"),
    }
}
