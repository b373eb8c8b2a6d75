use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::api_keys::ValidatedApiKey;

type HmacSha256 = Hmac<Sha256>;

/// The admitted payment method for one request.
#[derive(Debug, Clone)]
pub enum PaymentDecision {
    Free,
    ApiKey(ValidatedApiKey),
    Receipt(VerifiedReceipt),
}

impl PaymentDecision {
    pub fn branch(&self) -> &'static str {
        match self {
            PaymentDecision::Free => "free",
            PaymentDecision::ApiKey(_) => "api_key",
            PaymentDecision::Receipt(_) => "receipt",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedReceipt {
    pub tx_id: String,
    pub payer: String,
    pub amount_micro: i64,
    pub confirmations: u32,
}

/// Receipt headers presented by the caller on the x402 flow.
#[derive(Debug, Clone)]
pub struct ReceiptHeaders {
    pub receipt: String,
    pub nonce: String,
}

#[derive(Debug, Error)]
#[error("receipt verification failed ({status}): {code}")]
pub struct ReceiptError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

/// Collaborator that settles a presented receipt. Failure maps to the
/// verifier's own HTTP status; unreachability maps to 503.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    async fn verify(
        &self,
        headers: &ReceiptHeaders,
        binding: &str,
    ) -> Result<VerifiedReceipt, ReceiptError>;
}

pub struct HttpReceiptVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpReceiptVerifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct VerifierFailure {
    code: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl ReceiptVerifier for HttpReceiptVerifier {
    async fn verify(
        &self,
        headers: &ReceiptHeaders,
        binding: &str,
    ) -> Result<VerifiedReceipt, ReceiptError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "receipt": headers.receipt,
                "nonce": headers.nonce,
                "request_binding": binding,
            }))
            .send()
            .await
            .map_err(|err| ReceiptError {
                status: 503,
                code: "RECEIPT_VERIFIER_UNREACHABLE".to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let failure: VerifierFailure = response.json().await.unwrap_or(VerifierFailure {
                code: None,
                error: None,
            });
            return Err(ReceiptError {
                status,
                code: failure
                    .code
                    .unwrap_or_else(|| "RECEIPT_REJECTED".to_string()),
                message: failure
                    .error
                    .unwrap_or_else(|| "receipt rejected".to_string()),
            });
        }

        response.json().await.map_err(|err| ReceiptError {
            status: 503,
            code: "RECEIPT_VERIFIER_UNREACHABLE".to_string(),
            message: err.to_string(),
        })
    }
}

// ---------------- Challenge minting ----------------

/// Signed, time-limited description of what an anonymous caller must pay.
/// The binding ties a future receipt to this request shape so it cannot be
/// replayed elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub amount: String,
    pub recipient: String,
    pub chain_id: u64,
    pub token: String,
    pub nonce: String,
    pub expiry: i64,
    pub request_path: String,
    pub request_method: String,
    pub request_binding: String,
    pub hmac: String,
}

#[derive(Clone)]
pub struct ChallengeSigner {
    secret: Vec<u8>,
    pub amount_micro: i64,
    pub recipient: String,
    pub chain_id: u64,
    pub token: String,
    pub ttl_secs: i64,
}

/// Short hash prefix over the request fields a receipt must match.
pub fn request_binding(path: &str, method: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    for field in ["token_id", "message", "model"] {
        if let Some(value) = body.get(field).and_then(Value::as_str) {
            hasher.update(field.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
    }
    hex::encode(&hasher.finalize()[..8])
}

impl ChallengeSigner {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        amount_micro: i64,
        recipient: impl Into<String>,
        chain_id: u64,
        token: impl Into<String>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            secret: secret.into(),
            amount_micro,
            recipient: recipient.into(),
            chain_id,
            token: token.into(),
            ttl_secs,
        }
    }

    pub fn mint(&self, path: &str, method: &str, body: &Value) -> Challenge {
        let nonce = Uuid::new_v4().to_string();
        let expiry = Utc::now().timestamp() + self.ttl_secs;
        let binding = request_binding(path, method, body);
        let hmac = self.sign(&nonce, expiry, path, method, &binding);
        Challenge {
            amount: self.amount_micro.to_string(),
            recipient: self.recipient.clone(),
            chain_id: self.chain_id,
            token: self.token.clone(),
            nonce,
            expiry,
            request_path: path.to_string(),
            request_method: method.to_string(),
            request_binding: binding,
            hmac,
        }
    }

    pub fn verify(&self, challenge: &Challenge) -> bool {
        let expected = self.sign(
            &challenge.nonce,
            challenge.expiry,
            &challenge.request_path,
            &challenge.request_method,
            &challenge.request_binding,
        );
        let matches: bool = expected
            .as_bytes()
            .ct_eq(challenge.hmac.as_bytes())
            .into();
        matches && challenge.expiry > Utc::now().timestamp()
    }

    fn sign(&self, nonce: &str, expiry: i64, path: &str, method: &str, binding: &str) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.amount_micro,
            self.recipient,
            self.chain_id,
            self.token,
            nonce,
            expiry,
            method,
            path,
            binding,
        );
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signer() -> ChallengeSigner {
        ChallengeSigner::new(*b"server-secret-key-0123456789abcd", 100_000, "0xrecipient", 8453, "USDC", 300)
    }

    #[test]
    fn binding_covers_selected_body_fields() {
        let a = request_binding("/api/v1/agent/chat", "POST", &json!({"token_id": "1", "message": "hi"}));
        let b = request_binding("/api/v1/agent/chat", "POST", &json!({"token_id": "1", "message": "hi"}));
        let c = request_binding("/api/v1/agent/chat", "POST", &json!({"token_id": "2", "message": "hi"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn minted_challenge_verifies_and_tampering_breaks_it() {
        let signer = signer();
        let body = json!({"token_id": "1", "message": "hi"});
        let challenge = signer.mint("/api/v1/agent/chat", "POST", &body);
        assert!(signer.verify(&challenge));

        let mut tampered = challenge.clone();
        tampered.request_path = "/api/v1/other".to_string();
        assert!(!signer.verify(&tampered));

        let mut replayed = challenge.clone();
        replayed.nonce = Uuid::new_v4().to_string();
        assert!(!signer.verify(&replayed));
    }

    #[test]
    fn expired_challenge_fails_verification() {
        let mut signer = signer();
        signer.ttl_secs = -10;
        let challenge = signer.mint("/p", "POST", &json!({}));
        assert!(!signer.verify(&challenge));
    }
}
