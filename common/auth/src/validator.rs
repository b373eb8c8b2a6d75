use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::claims::{ClaimsRepr, EndpointKind, TenantContext};
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksCache;

/// Short-TTL set used for one-time jti registration. Implemented over the
/// remote store's atomic set-if-absent; `register` returns true only for
/// the first presentation of a key.
#[async_trait]
pub trait JtiStore: Send + Sync {
    async fn register(&self, namespaced_key: &str, ttl: Duration) -> AuthResult<bool>;
}

/// Length-prefixed replay namespace. The prefix is mandatory: without it
/// `("evil", "fake:victim")` and `("evil:fake", "victim")` collide.
pub fn jti_namespace(issuer: &str, jti: &str) -> String {
    format!("jti:{}:{}:{}", issuer.len(), issuer, jti)
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub issuer_allowlist: Vec<String>,
    pub invoke_audience: String,
    pub admin_audience: String,
    pub s2s_audience: String,
    pub leeway_secs: u64,
    /// s2s tokens without a jti must compensate with a short lifetime.
    pub s2s_max_token_age_secs: i64,
    pub jti_ttl: Duration,
}

impl ValidatorConfig {
    pub fn new(issuer_allowlist: Vec<String>) -> Self {
        Self {
            issuer_allowlist,
            invoke_audience: "loa-finn".to_string(),
            admin_audience: "loa-finn-admin".to_string(),
            s2s_audience: "arrakis".to_string(),
            leeway_secs: 30,
            s2s_max_token_age_secs: 60,
            jti_ttl: Duration::from_secs(15 * 60),
        }
    }

    pub fn audience_for(&self, endpoint: EndpointKind) -> &str {
        match endpoint {
            EndpointKind::Invoke => &self.invoke_audience,
            EndpointKind::Admin => &self.admin_audience,
            EndpointKind::ServiceToService => &self.s2s_audience,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuralHeader {
    alg: String,
    kid: Option<String>,
    #[serde(default, rename = "typ")]
    _typ: Option<String>,
}

/// Pre-signature structural gate. Exactly three base64url segments and a
/// header object pinning `alg` to ES256 with a non-empty `kid`; anything
/// else fails before signature work, which defeats alg:none and
/// algorithm-confusion presentations outright.
pub fn structural_check(token: &str) -> AuthResult<String> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|segment| segment.is_empty()) {
        return Err(AuthError::StructuralInvalid(
            "expected three non-empty segments".into(),
        ));
    }
    let header_bytes = URL_SAFE_NO_PAD
        .decode(segments[0])
        .map_err(|err| AuthError::StructuralInvalid(format!("header decode: {err}")))?;
    let header: StructuralHeader = serde_json::from_slice(&header_bytes)
        .map_err(|err| AuthError::StructuralInvalid(format!("header parse: {err}")))?;
    if header.alg != "ES256" {
        return Err(AuthError::StructuralInvalid(format!(
            "alg '{}' is not permitted",
            header.alg
        )));
    }
    match header.kid {
        Some(kid) if !kid.is_empty() => Ok(kid),
        _ => Err(AuthError::StructuralInvalid("missing kid".into())),
    }
}

pub struct JwtValidator {
    jwks: Arc<JwksCache>,
    jti_store: Arc<dyn JtiStore>,
    config: ValidatorConfig,
}

impl JwtValidator {
    pub fn new(jwks: Arc<JwksCache>, jti_store: Arc<dyn JtiStore>, config: ValidatorConfig) -> Self {
        Self {
            jwks,
            jti_store,
            config,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub async fn validate(&self, token: &str, endpoint: EndpointKind) -> AuthResult<TenantContext> {
        let kid = structural_check(token)?;
        let key = self.jwks.decoding_key(&kid).await?;

        let audience = self.config.audience_for(endpoint).to_string();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[&audience]);
        validation.leeway = self.config.leeway_secs;
        validation.validate_nbf = true;

        let data = decode::<Value>(token, &key, &validation).map_err(|err| match err.kind() {
            ErrorKind::InvalidAudience => AuthError::AudienceMismatch { expected: audience },
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            _ => AuthError::Verification(err.to_string()),
        })?;

        let repr: ClaimsRepr = serde_json::from_value(data.claims)
            .map_err(|err| AuthError::InvalidJson(err.to_string()))?;

        // Exact string match against the allowlist; no prefix or substring.
        if !self
            .config
            .issuer_allowlist
            .iter()
            .any(|allowed| allowed == &repr.iss)
        {
            return Err(AuthError::IssuerNotAllowed(repr.iss.clone()));
        }

        let tier = repr.tier()?;
        let tenant_id = repr.tenant_id()?.to_string();

        match endpoint {
            EndpointKind::Invoke => {
                if repr.req_hash.as_deref().map_or(true, str::is_empty) {
                    return Err(AuthError::InvalidClaim("req_hash", "<missing>".into()));
                }
                if repr.jti.is_none() {
                    return Err(AuthError::JtiRequired);
                }
            }
            EndpointKind::Admin => {
                if repr.jti.is_none() {
                    return Err(AuthError::JtiRequired);
                }
            }
            EndpointKind::ServiceToService => {
                if repr.jti.is_none() {
                    let iat = repr
                        .iat
                        .ok_or(AuthError::InvalidClaim("iat", "<missing>".into()))?;
                    if repr.exp - iat > self.config.s2s_max_token_age_secs {
                        return Err(AuthError::TokenTooLongLived {
                            max_secs: self.config.s2s_max_token_age_secs,
                        });
                    }
                }
            }
        }

        if let Some(jti) = repr.jti.as_deref() {
            let namespaced = jti_namespace(&repr.iss, jti);
            let fresh = self
                .jti_store
                .register(&namespaced, self.config.jti_ttl)
                .await?;
            if !fresh {
                return Err(AuthError::JtiReplay);
            }
        }

        debug!(kid, issuer = %repr.iss, "token validated");

        Ok(TenantContext {
            subject: repr.sub.clone(),
            tenant_id,
            tier,
            issuer: repr.iss.clone(),
            req_hash: repr.req_hash.clone(),
            nft_id: repr.nft_id.clone(),
            pool_id: repr.pool_id.clone(),
            allowed_pools: repr.allowed_pools.clone(),
            scopes: repr.scopes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_segment(value: &Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    fn fake_token(header: Value) -> String {
        format!(
            "{}.{}.{}",
            encode_segment(&header),
            encode_segment(&serde_json::json!({"sub": "s"})),
            URL_SAFE_NO_PAD.encode(b"sig")
        )
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(
            structural_check("a.b"),
            Err(AuthError::StructuralInvalid(_))
        ));
        assert!(matches!(
            structural_check("a.b.c.d"),
            Err(AuthError::StructuralInvalid(_))
        ));
    }

    #[test]
    fn rejects_alg_none_and_hs256_before_signature_work() {
        for alg in ["none", "HS256", "RS256"] {
            let token = fake_token(serde_json::json!({"alg": alg, "kid": "k1"}));
            match structural_check(&token) {
                Err(AuthError::StructuralInvalid(reason)) => {
                    assert!(reason.contains("not permitted"), "reason: {reason}")
                }
                other => panic!("alg {alg} should fail structurally, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_missing_kid() {
        let token = fake_token(serde_json::json!({"alg": "ES256"}));
        assert!(matches!(
            structural_check(&token),
            Err(AuthError::StructuralInvalid(_))
        ));
        let token = fake_token(serde_json::json!({"alg": "ES256", "kid": ""}));
        assert!(matches!(
            structural_check(&token),
            Err(AuthError::StructuralInvalid(_))
        ));
    }

    #[test]
    fn accepts_es256_with_kid() {
        let token = fake_token(serde_json::json!({"alg": "ES256", "kid": "k1", "typ": "JWT"}));
        assert_eq!(structural_check(&token).unwrap(), "k1");
    }

    #[test]
    fn jti_namespace_length_prefix_prevents_collisions() {
        assert_ne!(
            jti_namespace("evil", "fake:victim"),
            jti_namespace("evil:fake", "victim")
        );
        assert_eq!(jti_namespace("iss", "id"), "jti:3:iss:id");
    }
}
