use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_PREFIX: &str = "dk_";
const KEY_ID_HEX_LEN: usize = 16;
const SECRET_LEN: usize = 43;
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed API key")]
    InvalidFormat,
    #[error("key store failure: {0}")]
    Store(String),
    #[error("hashing failure: {0}")]
    Hash(String),
}

/// Process-wide HMAC key for deterministic lookup hashes. Loaded once at
/// startup from secret storage and passed by constructor.
#[derive(Clone)]
pub struct Pepper(Vec<u8>);

impl Pepper {
    pub fn from_base64(value: &str) -> Result<Self, KeyError> {
        let bytes = BASE64_STANDARD
            .decode(value.trim())
            .map_err(|err| KeyError::Hash(err.to_string()))?;
        if bytes.len() < 16 {
            return Err(KeyError::Hash("pepper shorter than 16 bytes".into()));
        }
        Ok(Self(bytes))
    }

    /// Deterministic index hash of the full plaintext key.
    pub fn lookup_hash(&self, plaintext: &str) -> String {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(plaintext.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Pepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pepper").field("bytes", &"***redacted***").finish()
    }
}

/// Plaintext shape `dk_key_<16 hex>.<43 base64url>`. Shown to the caller
/// exactly once at creation.
#[derive(Clone, PartialEq, Eq)]
pub struct PlaintextKey {
    pub key_id: String,
    pub secret: String,
}

impl PlaintextKey {
    pub fn generate() -> Self {
        let mut id_bytes = [0u8; KEY_ID_HEX_LEN / 2];
        OsRng.fill_bytes(&mut id_bytes);
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self {
            key_id: format!("key_{}", hex::encode(id_bytes)),
            secret: URL_SAFE_NO_PAD.encode(secret_bytes),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let rest = raw.strip_prefix(KEY_PREFIX).ok_or(KeyError::InvalidFormat)?;
        let (key_id, secret) = rest.split_once('.').ok_or(KeyError::InvalidFormat)?;
        let hex_part = key_id.strip_prefix("key_").ok_or(KeyError::InvalidFormat)?;
        if hex_part.len() != KEY_ID_HEX_LEN
            || !hex_part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(KeyError::InvalidFormat);
        }
        if secret.len() != SECRET_LEN
            || !secret
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(KeyError::InvalidFormat);
        }
        Ok(Self {
            key_id: key_id.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("{KEY_PREFIX}{}.{}", self.key_id, self.secret)
    }
}

impl std::fmt::Debug for PlaintextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextKey")
            .field("key_id", &self.key_id)
            .field("secret", &"***redacted***")
            .finish()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub label: String,
    pub lookup_hash: String,
    pub verifier_hash: String,
    pub balance_micro: i64,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ValidatedApiKey {
    pub key_id: String,
    pub tenant_id: String,
    pub label: String,
    pub balance_micro: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied { balance_after: i64 },
    /// Guarded update matched no row: exhausted credits or revoked key.
    InsufficientFunds,
    /// The request id was already billed; the stored result is returned.
    Replayed { balance_after: i64 },
}

#[async_trait]
pub trait KeyRepo: Send + Sync {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), KeyError>;
    async fn find_by_lookup_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, KeyError>;
    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, KeyError>;
    async fn revoke(&self, key_id: &str) -> Result<bool, KeyError>;
    /// Atomic check-and-debit plus billing event, keyed by `request_id`.
    async fn debit(
        &self,
        key_id: &str,
        request_id: Uuid,
        amount_micro: i64,
    ) -> Result<DebitOutcome, KeyError>;
}

// ---------------- Postgres implementation ----------------

pub struct PgKeyRepo {
    pool: PgPool,
}

impl PgKeyRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyRepo for PgKeyRepo {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), KeyError> {
        sqlx::query(
            "INSERT INTO api_keys (key_id, tenant_id, label, lookup_hash, verifier_hash, balance_micro, revoked, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&record.key_id)
        .bind(&record.tenant_id)
        .bind(&record.label)
        .bind(&record.lookup_hash)
        .bind(&record.verifier_hash)
        .bind(record.balance_micro)
        .bind(record.revoked)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| KeyError::Store(err.to_string()))?;
        Ok(())
    }

    async fn find_by_lookup_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, KeyError> {
        sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT key_id, tenant_id, label, lookup_hash, verifier_hash, balance_micro, revoked, created_at, updated_at
             FROM api_keys WHERE lookup_hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| KeyError::Store(err.to_string()))
    }

    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, KeyError> {
        sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT key_id, tenant_id, label, lookup_hash, verifier_hash, balance_micro, revoked, created_at, updated_at
             FROM api_keys WHERE key_id = $1",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| KeyError::Store(err.to_string()))
    }

    async fn revoke(&self, key_id: &str) -> Result<bool, KeyError> {
        let result = sqlx::query("UPDATE api_keys SET revoked = TRUE, updated_at = now() WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|err| KeyError::Store(err.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn debit(
        &self,
        key_id: &str,
        request_id: Uuid,
        amount_micro: i64,
    ) -> Result<DebitOutcome, KeyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| KeyError::Store(err.to_string()))?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT balance_after_micro FROM billing_events WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| KeyError::Store(err.to_string()))?;
        if let Some((balance_after,)) = existing {
            return Ok(DebitOutcome::Replayed { balance_after });
        }

        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE api_keys SET balance_micro = balance_micro - $1, updated_at = now()
             WHERE key_id = $2 AND balance_micro >= $1 AND NOT revoked
             RETURNING balance_micro",
        )
        .bind(amount_micro)
        .bind(key_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| KeyError::Store(err.to_string()))?;

        let Some((balance_after,)) = updated else {
            return Ok(DebitOutcome::InsufficientFunds);
        };

        let inserted = sqlx::query(
            "INSERT INTO billing_events (id, api_key_id, request_id, amount_micro, balance_after_micro, event_type, created_at)
             VALUES ($1, $2, $3, $4, $5, 'debit', now())
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(key_id)
        .bind(request_id)
        .bind(amount_micro)
        .bind(balance_after)
        .execute(&mut *tx)
        .await
        .map_err(|err| KeyError::Store(err.to_string()))?;

        if inserted.rows_affected() == 0 {
            // Lost the race on the same request id; surface the committed result.
            tx.rollback()
                .await
                .map_err(|err| KeyError::Store(err.to_string()))?;
            let committed: (i64,) =
                sqlx::query_as("SELECT balance_after_micro FROM billing_events WHERE request_id = $1")
                    .bind(request_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|err| KeyError::Store(err.to_string()))?;
            return Ok(DebitOutcome::Replayed {
                balance_after: committed.0,
            });
        }

        tx.commit()
            .await
            .map_err(|err| KeyError::Store(err.to_string()))?;
        Ok(DebitOutcome::Applied { balance_after })
    }
}

// ---------------- In-memory implementation (tests, local dev) ----------------

#[derive(Default)]
pub struct MemoryKeyRepo {
    inner: std::sync::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    keys: HashMap<String, ApiKeyRecord>,
    events: HashMap<Uuid, (String, i64, i64)>,
}

impl MemoryKeyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Billing events as (api_key_id, amount, balance_after), for assertions.
    pub fn event(&self, request_id: Uuid) -> Option<(String, i64, i64)> {
        self.inner
            .lock()
            .expect("key repo poisoned")
            .events
            .get(&request_id)
            .cloned()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().expect("key repo poisoned").events.len()
    }
}

#[async_trait]
impl KeyRepo for MemoryKeyRepo {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), KeyError> {
        self.inner
            .lock()
            .expect("key repo poisoned")
            .keys
            .insert(record.key_id.clone(), record);
        Ok(())
    }

    async fn find_by_lookup_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, KeyError> {
        Ok(self
            .inner
            .lock()
            .expect("key repo poisoned")
            .keys
            .values()
            .find(|record| record.lookup_hash == hash)
            .cloned())
    }

    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, KeyError> {
        Ok(self
            .inner
            .lock()
            .expect("key repo poisoned")
            .keys
            .get(key_id)
            .cloned())
    }

    async fn revoke(&self, key_id: &str) -> Result<bool, KeyError> {
        let mut guard = self.inner.lock().expect("key repo poisoned");
        match guard.keys.get_mut(key_id) {
            Some(record) => {
                record.revoked = true;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn debit(
        &self,
        key_id: &str,
        request_id: Uuid,
        amount_micro: i64,
    ) -> Result<DebitOutcome, KeyError> {
        let mut guard = self.inner.lock().expect("key repo poisoned");
        if let Some((_, _, balance_after)) = guard.events.get(&request_id) {
            return Ok(DebitOutcome::Replayed {
                balance_after: *balance_after,
            });
        }
        let Some(record) = guard.keys.get_mut(key_id) else {
            return Ok(DebitOutcome::InsufficientFunds);
        };
        if record.revoked || record.balance_micro < amount_micro {
            return Ok(DebitOutcome::InsufficientFunds);
        }
        record.balance_micro -= amount_micro;
        record.updated_at = Utc::now();
        let balance_after = record.balance_micro;
        guard
            .events
            .insert(request_id, (key_id.to_string(), amount_micro, balance_after));
        Ok(DebitOutcome::Applied { balance_after })
    }
}

// ---------------- Manager ----------------

enum CacheEntry {
    Valid {
        key: ValidatedApiKey,
        cached_at: Instant,
    },
    Revoked {
        cached_at: Instant,
    },
}

/// Cache-pepper-lookup key manager. Validation results are cached by
/// lookup hash for five minutes; revocation writes a sentinel so a cache
/// hit on a revoked key returns without a store read.
pub struct ApiKeyManager {
    repo: Arc<dyn KeyRepo>,
    pepper: Pepper,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl ApiKeyManager {
    pub fn new(repo: Arc<dyn KeyRepo>, pepper: Pepper) -> Self {
        Self {
            repo,
            pepper,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &Arc<dyn KeyRepo> {
        &self.repo
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        label: &str,
        initial_balance_micro: i64,
    ) -> Result<(PlaintextKey, ValidatedApiKey), KeyError> {
        let plaintext = PlaintextKey::generate();
        let verifier_hash = Argon2::default()
            .hash_password(plaintext.secret.as_bytes(), &SaltString::generate(&mut OsRng))
            .map_err(|err| KeyError::Hash(err.to_string()))?
            .to_string();
        let now = Utc::now();
        let record = ApiKeyRecord {
            key_id: plaintext.key_id.clone(),
            tenant_id: tenant_id.to_string(),
            label: label.to_string(),
            lookup_hash: self.pepper.lookup_hash(&plaintext.render()),
            verifier_hash,
            balance_micro: initial_balance_micro,
            revoked: false,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert(record.clone()).await?;
        Ok((
            plaintext,
            ValidatedApiKey {
                key_id: record.key_id,
                tenant_id: record.tenant_id,
                label: record.label,
                balance_micro: record.balance_micro,
            },
        ))
    }

    /// Full plaintext validation: cache, then store lookup by pepper hash,
    /// then constant-time secret verification.
    pub async fn validate(&self, raw: &str) -> Result<Option<ValidatedApiKey>, KeyError> {
        let plaintext = match PlaintextKey::parse(raw) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(None),
        };
        let lookup_hash = self.pepper.lookup_hash(raw);

        {
            let cache = self.cache.read().await;
            match cache.get(&lookup_hash) {
                Some(CacheEntry::Valid { key, cached_at }) if cached_at.elapsed() < CACHE_TTL => {
                    return Ok(Some(key.clone()));
                }
                Some(CacheEntry::Revoked { cached_at }) if cached_at.elapsed() < CACHE_TTL => {
                    return Ok(None);
                }
                _ => {}
            }
        }

        let Some(record) = self.repo.find_by_lookup_hash(&lookup_hash).await? else {
            return Ok(None);
        };

        let parsed_hash = PasswordHash::new(&record.verifier_hash)
            .map_err(|err| KeyError::Hash(err.to_string()))?;
        if Argon2::default()
            .verify_password(plaintext.secret.as_bytes(), &parsed_hash)
            .is_err()
        {
            return Ok(None);
        }

        if record.revoked {
            self.cache.write().await.insert(
                lookup_hash,
                CacheEntry::Revoked {
                    cached_at: Instant::now(),
                },
            );
            return Ok(None);
        }

        let validated = ValidatedApiKey {
            key_id: record.key_id,
            tenant_id: record.tenant_id,
            label: record.label,
            balance_micro: record.balance_micro,
        };
        self.cache.write().await.insert(
            lookup_hash,
            CacheEntry::Valid {
                key: validated.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some(validated))
    }

    pub async fn revoke(&self, key_id: &str) -> Result<bool, KeyError> {
        let record = self.repo.find_by_key_id(key_id).await?;
        let revoked = self.repo.revoke(key_id).await?;
        if revoked {
            if let Some(record) = record {
                self.cache.write().await.insert(
                    record.lookup_hash,
                    CacheEntry::Revoked {
                        cached_at: Instant::now(),
                    },
                );
            }
        }
        Ok(revoked)
    }

    pub async fn debit(
        &self,
        key_id: &str,
        request_id: Uuid,
        amount_micro: i64,
    ) -> Result<DebitOutcome, KeyError> {
        let outcome = self.repo.debit(key_id, request_id, amount_micro).await?;
        if let DebitOutcome::InsufficientFunds = outcome {
            warn!(key_id, amount_micro, "debit refused");
        }
        Ok(outcome)
    }

    /// Evict entries past the cache TTL; driven by the scheduler.
    pub async fn sweep_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| match entry {
            CacheEntry::Valid { cached_at, .. } | CacheEntry::Revoked { cached_at } => {
                cached_at.elapsed() < CACHE_TTL
            }
        });
    }
}
