use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// Fetches and parses an upstream JWKS document (P-256 keys only).
#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> AuthResult<Vec<FetchedKey>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for entry in body.keys.into_iter() {
            let raw = serde_json::to_value(&entry)
                .map_err(|err| AuthError::JwksDecode(err.to_string()))?;
            let kid = entry.kid.ok_or(AuthError::JwksMissingKid)?;
            let kty = entry.kty.unwrap_or_else(|| "EC".to_string());
            if kty != "EC" {
                return Err(AuthError::JwksUnsupportedKey {
                    kid,
                    detail: format!("kty={kty}"),
                });
            }
            if let Some(crv) = entry.crv.as_deref() {
                if crv != "P-256" {
                    return Err(AuthError::JwksUnsupportedKey {
                        kid,
                        detail: format!("crv={crv}"),
                    });
                }
            }
            if let Some(alg) = entry.alg.as_deref() {
                if alg != "ES256" {
                    return Err(AuthError::JwksUnsupportedKey {
                        kid,
                        detail: format!("alg={alg}"),
                    });
                }
            }
            let x = entry
                .x
                .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;
            let y = entry
                .y
                .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;
            let key = DecodingKey::from_ec_components(&x, &y)
                .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
            keys.push(FetchedKey { kid, key, raw });
        }

        Ok(keys)
    }
}

pub struct FetchedKey {
    pub kid: String,
    pub key: DecodingKey,
    /// Original JWK object, kept for re-serving the trusted set.
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct JwkEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    y: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    use_: Option<String>,
}

/// Self-classified freshness of the trusted key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwksHealth {
    Healthy,
    Stale,
    Degraded,
}

impl JwksHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            JwksHealth::Healthy => "healthy",
            JwksHealth::Stale => "stale",
            JwksHealth::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub stale_threshold_ms: i64,
    pub max_staleness_ms: i64,
    pub min_refresh_interval_ms: i64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: i64,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 15 * 60 * 1000,
            max_staleness_ms: 24 * 60 * 60 * 1000,
            min_refresh_interval_ms: 1000,
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: 60_000,
        }
    }
}

impl JwksConfig {
    /// Tightened staleness limit for key-compromise response.
    pub fn compromise_mode(mut self) -> Self {
        self.max_staleness_ms = 60 * 60 * 1000;
        self
    }
}

#[derive(Default)]
struct KeySet {
    keys: HashMap<String, DecodingKey>,
    raw: Vec<Value>,
}

#[derive(Default)]
struct Meta {
    last_success_ms: Option<i64>,
    last_attempt_ms: Option<i64>,
    consecutive_failures: u32,
    circuit_open_until_ms: Option<i64>,
}

/// Copy-on-write key cache with HEALTHY/STALE/DEGRADED classification.
///
/// Readers take an immutable snapshot; refresh swaps the snapshot whole.
/// State starts DEGRADED until the first successful fetch.
pub struct JwksCache {
    fetcher: Option<JwksFetcher>,
    config: JwksConfig,
    snapshot: RwLock<Arc<KeySet>>,
    meta: Mutex<Meta>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl JwksCache {
    pub fn new(fetcher: JwksFetcher, config: JwksConfig) -> Self {
        Self {
            fetcher: Some(fetcher),
            config,
            snapshot: RwLock::new(Arc::new(KeySet::default())),
            meta: Mutex::new(Meta::default()),
        }
    }

    /// Cache with no upstream; keys are installed explicitly.
    pub fn static_only(config: JwksConfig) -> Self {
        Self {
            fetcher: None,
            config,
            snapshot: RwLock::new(Arc::new(KeySet::default())),
            meta: Mutex::new(Meta::default()),
        }
    }

    /// Replace the trusted set and mark a successful fetch at `at_ms`.
    pub fn install_keys_at(&self, keys: Vec<FetchedKey>, at_ms: i64) {
        let mut map = HashMap::new();
        let mut raw = Vec::new();
        for entry in keys {
            map.insert(entry.kid, entry.key);
            raw.push(entry.raw);
        }
        *self.snapshot.write().expect("jwks snapshot poisoned") =
            Arc::new(KeySet { keys: map, raw });
        let mut meta = self.meta.lock().expect("jwks meta poisoned");
        meta.last_success_ms = Some(at_ms);
        meta.consecutive_failures = 0;
        meta.circuit_open_until_ms = None;
    }

    pub fn install_keys(&self, keys: Vec<FetchedKey>) {
        self.install_keys_at(keys, now_ms());
    }

    pub fn health(&self) -> JwksHealth {
        self.health_at(now_ms())
    }

    pub fn health_at(&self, at_ms: i64) -> JwksHealth {
        let meta = self.meta.lock().expect("jwks meta poisoned");
        match meta.last_success_ms {
            None => JwksHealth::Degraded,
            Some(success) => {
                let age = at_ms - success;
                if age > self.config.max_staleness_ms {
                    JwksHealth::Degraded
                } else if age > self.config.stale_threshold_ms {
                    JwksHealth::Stale
                } else {
                    JwksHealth::Healthy
                }
            }
        }
    }

    /// Trusted JWK objects for re-serving at /.well-known/jwks.json.
    pub fn raw_keys(&self) -> Vec<Value> {
        self.snapshot
            .read()
            .expect("jwks snapshot poisoned")
            .raw
            .clone()
    }

    pub fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.snapshot
            .read()
            .expect("jwks snapshot poisoned")
            .keys
            .get(kid)
            .cloned()
    }

    pub fn key_count(&self) -> usize {
        self.snapshot
            .read()
            .expect("jwks snapshot poisoned")
            .keys
            .len()
    }

    /// Drop to DEGRADED without discarding known keys. Known kids keep
    /// validating; unknown kids are rejected until the next successful
    /// scheduled refresh.
    pub fn invalidate(&self) {
        let mut meta = self.meta.lock().expect("jwks meta poisoned");
        meta.last_success_ms = None;
        meta.consecutive_failures = 0;
        meta.circuit_open_until_ms = None;
    }

    /// Refresh policy: at most one attempt per `min_refresh_interval_ms`;
    /// after `circuit_failure_threshold` consecutive failures the circuit
    /// opens for `circuit_cooldown_ms` and refreshes return the cached set
    /// unchanged.
    pub async fn refresh(&self) -> AuthResult<usize> {
        let Some(fetcher) = &self.fetcher else {
            return Ok(self.key_count());
        };
        let at = now_ms();
        {
            let mut meta = self.meta.lock().expect("jwks meta poisoned");
            if let Some(open_until) = meta.circuit_open_until_ms {
                if at < open_until {
                    debug!("JWKS refresh suppressed; circuit open");
                    return Ok(self.key_count());
                }
                meta.circuit_open_until_ms = None;
            }
            if let Some(last) = meta.last_attempt_ms {
                if at - last < self.config.min_refresh_interval_ms {
                    return Ok(self.key_count());
                }
            }
            meta.last_attempt_ms = Some(at);
        }

        match fetcher.fetch().await {
            Ok(keys) if !keys.is_empty() => {
                let count = keys.len();
                self.install_keys_at(keys, now_ms());
                debug!(count, "JWKS refreshed");
                Ok(count)
            }
            Ok(_) => {
                self.note_failure(now_ms());
                Err(AuthError::JwksDecode("empty key set".into()))
            }
            Err(err) => {
                self.note_failure(now_ms());
                warn!(error = %err, "JWKS refresh failed");
                Err(err)
            }
        }
    }

    fn note_failure(&self, at_ms: i64) {
        let mut meta = self.meta.lock().expect("jwks meta poisoned");
        meta.consecutive_failures += 1;
        if meta.consecutive_failures >= self.config.circuit_failure_threshold {
            meta.circuit_open_until_ms = Some(at_ms + self.config.circuit_cooldown_ms);
            meta.consecutive_failures = 0;
            warn!(
                cooldown_ms = self.config.circuit_cooldown_ms,
                "JWKS refresh circuit opened"
            );
        }
    }

    /// Resolve a decoding key under the per-state validation policy.
    ///
    /// HEALTHY: unknown kid awaits one refresh, then rejects.
    /// STALE: known kid accepted without refresh; unknown kid refreshes once.
    /// DEGRADED: known kid accepted; unknown kid rejected with no network
    /// call so the request cannot hang on a dead upstream.
    pub async fn decoding_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }
        match self.health() {
            JwksHealth::Degraded => Err(AuthError::JwksDegraded),
            JwksHealth::Healthy | JwksHealth::Stale => {
                if let Err(err) = self.refresh().await {
                    debug!(error = %err, kid, "refresh for unknown kid failed");
                }
                self.lookup(kid)
                    .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_X: &str = "0Z-X0vyUke04atH7hNmB7hAwBdHiQ6mdKR9I9mNaNhg";
    const TEST_Y: &str = "sZQpSLUU9W6miIqaoUidm1e4ltx-e653KPIehMr4a54";

    fn fetched(kid: &str) -> FetchedKey {
        FetchedKey {
            kid: kid.to_string(),
            key: DecodingKey::from_ec_components(TEST_X, TEST_Y).unwrap(),
            raw: serde_json::json!({"kid": kid, "kty": "EC", "crv": "P-256", "x": TEST_X, "y": TEST_Y}),
        }
    }

    #[test]
    fn starts_degraded_then_walks_the_ladder() {
        let cache = JwksCache::static_only(JwksConfig::default());
        assert_eq!(cache.health_at(0), JwksHealth::Degraded);

        cache.install_keys_at(vec![fetched("k1")], 0);
        assert_eq!(cache.health_at(0), JwksHealth::Healthy);
        // 16 minutes on: past the quiescence threshold.
        assert_eq!(cache.health_at(16 * 60 * 1000), JwksHealth::Stale);
        // 25 hours on: past the staleness limit.
        assert_eq!(cache.health_at(25 * 60 * 60 * 1000), JwksHealth::Degraded);
    }

    #[test]
    fn invalidate_degrades_but_keeps_keys() {
        let cache = JwksCache::static_only(JwksConfig::default());
        cache.install_keys_at(vec![fetched("k1")], 0);
        cache.invalidate();
        assert_eq!(cache.health_at(0), JwksHealth::Degraded);
        assert!(cache.lookup("k1").is_some());
    }

    #[tokio::test]
    async fn degraded_unknown_kid_rejects_without_network() {
        let cache = JwksCache::static_only(JwksConfig::default());
        cache.install_keys_at(vec![fetched("k1")], 0);
        cache.invalidate();
        assert!(cache.decoding_key("k1").await.is_ok());
        match cache.decoding_key("other").await {
            Err(AuthError::JwksDegraded) => {}
            Err(other) => panic!("expected JwksDegraded, got Err({other:?})"),
            Ok(_) => panic!("expected JwksDegraded, got Ok(_)"),
        }
    }

    #[test]
    fn compromise_mode_tightens_staleness() {
        let cache = JwksCache::static_only(JwksConfig::default().compromise_mode());
        cache.install_keys_at(vec![fetched("k1")], 0);
        assert_eq!(cache.health_at(2 * 60 * 60 * 1000), JwksHealth::Degraded);
    }
}
