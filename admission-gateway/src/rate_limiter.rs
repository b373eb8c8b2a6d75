use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common_store::{StateStore, SLIDING_WINDOW_SCRIPT};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Tiered sliding-window limits. The windowed count is measured over the
/// trailing `window_ms`, not calendar buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    FreePerIp,
    X402PerWallet,
    ChallengePerIp,
    ApiKeyDefault,
}

impl RateTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateTier::FreePerIp => "free_per_ip",
            RateTier::X402PerWallet => "x402_per_wallet",
            RateTier::ChallengePerIp => "challenge_per_ip",
            RateTier::ApiKeyDefault => "api_key_default",
        }
    }

    pub fn limits(&self) -> (u32, u64) {
        match self {
            RateTier::FreePerIp => (60, 60_000),
            RateTier::X402PerWallet => (30, 60_000),
            RateTier::ChallengePerIp => (120, 60_000),
            RateTier::ApiKeyDefault => (60, 60_000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
    pub reset_secs: u64,
    /// True when the in-process fallback produced this decision.
    pub degraded: bool,
}

/// Sliding-window limiter over the remote store's atomic script. The script
/// is the only mutation point, which is what keeps concurrent checks fair.
///
/// When the store reports a persistent failure the limiter degrades to an
/// in-process 1-request-per-minute-per-identifier safety net. That is a
/// stopgap, not a service level.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    prefix: String,
    fallback: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            fallback: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, tier: RateTier, identifier: &str) -> RateDecision {
        let (max_requests, window_ms) = tier.limits();
        let window_secs = window_ms.div_ceil(1000);
        let key = format!("{}:{}:{}", self.prefix, tier.as_str(), identifier);
        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let reply = self
            .store
            .eval_script(
                &SLIDING_WINDOW_SCRIPT,
                &[&key],
                &[
                    &now_ms.to_string(),
                    &window_ms.to_string(),
                    &max_requests.to_string(),
                    &member,
                    &window_secs.to_string(),
                ],
            )
            .await;

        match reply {
            Ok(values) if values.len() == 2 => {
                let allowed = values[0] == 1;
                let count = values[1].max(0) as u32;
                RateDecision {
                    allowed,
                    limit: max_requests,
                    remaining: max_requests.saturating_sub(count),
                    retry_after_secs: if allowed { 0 } else { window_secs },
                    reset_secs: window_secs,
                    degraded: false,
                }
            }
            Ok(other) => {
                warn!(?other, tier = tier.as_str(), "unexpected rate script reply");
                self.fallback_check(identifier, max_requests, window_secs).await
            }
            Err(err) => {
                warn!(error = %err, tier = tier.as_str(), "rate store unavailable; using fallback");
                self.fallback_check(identifier, max_requests, window_secs).await
            }
        }
    }

    async fn fallback_check(
        &self,
        identifier: &str,
        limit: u32,
        reset_secs: u64,
    ) -> RateDecision {
        let mut guard = self.fallback.lock().await;
        let now = Instant::now();
        guard.retain(|_, last| now.duration_since(*last) < Duration::from_secs(60));
        let allowed = match guard.get(identifier) {
            Some(last) if now.duration_since(*last) < Duration::from_secs(60) => false,
            _ => {
                guard.insert(identifier.to_string(), now);
                true
            }
        };
        RateDecision {
            allowed,
            limit,
            remaining: 0,
            retry_after_secs: if allowed { 0 } else { 60 },
            reset_secs: reset_secs.max(60),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_store::{MemoryStore, ScriptSpec, StoreError, StoreResult};

    #[tokio::test]
    async fn admits_exactly_the_limit_under_concurrency() {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new()), "t"));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(RateTier::FreePerIp, "203.0.113.9").await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 60);
    }

    #[tokio::test]
    async fn denial_carries_retry_after() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), "t");
        for _ in 0..30 {
            assert!(limiter.check(RateTier::X402PerWallet, "0xwallet").await.allowed);
        }
        let denied = limiter.check(RateTier::X402PerWallet, "0xwallet").await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 60);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn identifiers_do_not_share_windows() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), "t");
        for _ in 0..60 {
            assert!(limiter.check(RateTier::ApiKeyDefault, "key-a").await.allowed);
        }
        assert!(!limiter.check(RateTier::ApiKeyDefault, "key-a").await.allowed);
        assert!(limiter.check(RateTier::ApiKeyDefault, "key-b").await.allowed);
    }

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn set(
            &self,
            _: &str,
            _: &str,
            _: Option<std::time::Duration>,
        ) -> StoreResult<()> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn set_if_absent(
            &self,
            _: &str,
            _: &str,
            _: std::time::Duration,
        ) -> StoreResult<bool> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn delete(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn increment(&self, _: &str, _: i64) -> StoreResult<i64> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn sorted_set_add(&self, _: &str, _: i64, _: &str) -> StoreResult<()> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn sorted_set_remove_range(&self, _: &str, _: i64, _: i64) -> StoreResult<u64> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn sorted_set_count(&self, _: &str) -> StoreResult<u64> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn eval_script(
            &self,
            _: &ScriptSpec,
            _: &[&str],
            _: &[&str],
        ) -> StoreResult<Vec<i64>> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn publish(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Persistent("down".into()))
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Persistent("down".into()))
        }
    }

    #[tokio::test]
    async fn store_outage_degrades_to_one_per_minute() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), "t");
        let first = limiter.check(RateTier::FreePerIp, "203.0.113.1").await;
        assert!(first.allowed);
        assert!(first.degraded);
        let second = limiter.check(RateTier::FreePerIp, "203.0.113.1").await;
        assert!(!second.allowed);
        assert_eq!(second.retry_after_secs, 60);
    }
}
