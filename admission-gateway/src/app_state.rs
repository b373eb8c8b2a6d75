use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_auth::{AuthError, JtiStore, JwksCache, JwtValidator};
use common_store::StateStore;

use crate::agent::AgentRuntime;
use crate::api_keys::ApiKeyManager;
use crate::budget::BudgetReconciler;
use crate::metrics::GatewayMetrics;
use crate::payment::{ChallengeSigner, ReceiptVerifier};
use crate::personas::PersonaSource;
use crate::rate_limiter::RateLimiter;
use crate::worker_pool::PoolHandle;

/// One-time jti registration over the remote store's set-if-absent. A
/// store failure fails closed: the token is not accepted on faith.
pub struct StoreJtiStore {
    store: Arc<dyn StateStore>,
}

impl StoreJtiStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JtiStore for StoreJtiStore {
    async fn register(&self, namespaced_key: &str, ttl: Duration) -> Result<bool, AuthError> {
        self.store
            .set_if_absent(namespaced_key, "1", ttl)
            .await
            .map_err(|err| AuthError::ReplayStore(err.to_string()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub jwks: Arc<JwksCache>,
    pub validator: Arc<JwtValidator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub keys: Arc<ApiKeyManager>,
    pub receipts: Option<Arc<dyn ReceiptVerifier>>,
    pub challenge: Arc<ChallengeSigner>,
    pub budget: Arc<BudgetReconciler>,
    pub agent: Arc<dyn AgentRuntime>,
    pub personas: Arc<dyn PersonaSource>,
    pub pool: PoolHandle,
    pub metrics: Arc<GatewayMetrics>,
    pub cost_per_request_micro: i64,
}
