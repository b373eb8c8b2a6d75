use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("structurally invalid token: {0}")]
    StructuralInvalid(String),
    #[error("no decoding key registered for kid '{0}'")]
    UnknownKeyId(String),
    #[error("key set degraded; unknown kid rejected without refresh")]
    JwksDegraded,
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("issuer '{0}' is not allowed")]
    IssuerNotAllowed(String),
    #[error("audience mismatch; expected '{expected}'")]
    AudienceMismatch { expected: String },
    #[error("jti claim is required on this endpoint")]
    JtiRequired,
    #[error("token replay detected")]
    JtiReplay,
    #[error("service token lifetime exceeds {max_secs}s")]
    TokenTooLongLived { max_secs: i64 },
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),
    #[error("failed to parse JWKS response: {0}")]
    JwksDecode(String),
    #[error("JWKS entry missing key id (kid)")]
    JwksMissingKid,
    #[error("JWKS key '{0}' missing required EC components")]
    JwksMissingComponents(String),
    #[error("JWKS key '{kid}' uses unsupported parameters '{detail}'")]
    JwksUnsupportedKey { kid: String, detail: String },
    #[error("failed to parse decoding key for kid '{0}': {1}")]
    KeyParse(String, String),
    #[error("replay-guard store failure: {0}")]
    ReplayStore(String),
}

impl AuthError {
    /// Stable machine code surfaced in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::StructuralInvalid(_) => "JWT_STRUCTURAL_INVALID",
            AuthError::JwksDegraded => "JWKS_DEGRADED",
            AuthError::IssuerNotAllowed(_) => "ISSUER_NOT_ALLOWED",
            AuthError::AudienceMismatch { .. } => "AUDIENCE_MISMATCH",
            AuthError::JtiRequired => "JTI_REQUIRED",
            AuthError::JtiReplay => "JTI_REPLAY_DETECTED",
            AuthError::ReplayStore(_)
            | AuthError::JwksFetch(_)
            | AuthError::JwksDecode(_)
            | AuthError::JwksMissingKid
            | AuthError::JwksMissingComponents(_)
            | AuthError::JwksUnsupportedKey { .. }
            | AuthError::KeyParse(_, _) => "JWKS_UNAVAILABLE",
            _ => "JWT_INVALID",
        }
    }
}
