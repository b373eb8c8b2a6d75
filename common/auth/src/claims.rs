use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Endpoint families with distinct audience and jti requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Invoke,
    Admin,
    ServiceToService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Tier> {
        match value {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "pro" => Some(Tier::Pro),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

/// Application view of a validated token.
#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub subject: String,
    pub tenant_id: String,
    pub tier: Tier,
    pub issuer: String,
    pub req_hash: Option<String>,
    pub nft_id: Option<String>,
    pub pool_id: Option<String>,
    pub allowed_pools: Option<Vec<String>>,
    pub scopes: Vec<String>,
}

impl TenantContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|value| value == scope)
    }
}

/// Raw claim shape; unknown claims are tolerated for forward compatibility.
#[derive(Debug, Deserialize)]
pub(crate) struct ClaimsRepr {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub req_hash: Option<String>,
    #[serde(default)]
    pub nft_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub allowed_pools: Option<Vec<String>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl ClaimsRepr {
    pub(crate) fn tier(&self) -> AuthResult<Tier> {
        let raw = self
            .tier
            .as_deref()
            .ok_or(AuthError::InvalidClaim("tier", "<missing>".into()))?;
        Tier::parse(raw).ok_or_else(|| AuthError::InvalidClaim("tier", raw.to_string()))
    }

    pub(crate) fn tenant_id(&self) -> AuthResult<&str> {
        self.tenant_id
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::InvalidClaim("tenant_id", "<missing>".into()))
    }

    pub(crate) fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parse_rejects_unknown() {
        assert_eq!(Tier::parse("pro"), Some(Tier::Pro));
        assert_eq!(Tier::parse("platinum"), None);
    }

    #[test]
    fn scopes_split_on_whitespace() {
        let repr: ClaimsRepr = serde_json::from_value(serde_json::json!({
            "iss": "i", "sub": "s", "exp": 1,
            "scope": "admin:jwks billing:read"
        }))
        .unwrap();
        assert_eq!(repr.scopes(), vec!["admin:jwks", "billing:read"]);
    }
}
