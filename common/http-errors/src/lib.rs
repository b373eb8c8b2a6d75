use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

/// Wire shape of every error response: a human string plus a stable code.
/// The `code` field is the versioned contract; `error` is advisory.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<serde_json::Value>,
}

/// The strict status-code matrix. 401 is reserved for authentication
/// failures, 402 for payment-required; no other variant may produce
/// either status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
    },
    Unauthorized {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
    },
    PaymentRequired {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
        /// Emit `X-Payment-Upgrade: x402` so the caller can switch flows.
        upgrade: bool,
        /// Structured challenge for anonymous callers.
        challenge: Option<serde_json::Value>,
    },
    Forbidden {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
    },
    NotFound {
        code: &'static str,
        request_id: Option<Uuid>,
    },
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        remaining: u32,
        reset_secs: u64,
        request_id: Option<Uuid>,
    },
    Internal {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
    },
    Unavailable {
        code: &'static str,
        message: String,
        request_id: Option<Uuid>,
        retry_after_secs: Option<u64>,
    },
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal {
            code: "internal_error",
            message: err.to_string(),
            request_id: None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { code, .. }
            | ApiError::Unauthorized { code, .. }
            | ApiError::PaymentRequired { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::NotFound { code, .. }
            | ApiError::Internal { code, .. }
            | ApiError::Unavailable { code, .. } => code,
            ApiError::RateLimited { .. } => "RATE_LIMITED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn with_request_id(mut self, id: Uuid) -> Self {
        match &mut self {
            ApiError::BadRequest { request_id, .. }
            | ApiError::Unauthorized { request_id, .. }
            | ApiError::PaymentRequired { request_id, .. }
            | ApiError::Forbidden { request_id, .. }
            | ApiError::NotFound { request_id, .. }
            | ApiError::RateLimited { request_id, .. }
            | ApiError::Internal { request_id, .. }
            | ApiError::Unavailable { request_id, .. } => *request_id = Some(id),
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (body, extra_headers) = match self {
            ApiError::BadRequest {
                code,
                message,
                request_id,
            }
            | ApiError::Unauthorized {
                code,
                message,
                request_id,
            }
            | ApiError::Forbidden {
                code,
                message,
                request_id,
            }
            | ApiError::Internal {
                code,
                message,
                request_id,
            } => (
                ErrorBody {
                    error: message,
                    code: code.into(),
                    request_id,
                    challenge: None,
                },
                Vec::new(),
            ),
            ApiError::NotFound { code, request_id } => (
                ErrorBody {
                    error: "resource not found".into(),
                    code: code.into(),
                    request_id,
                    challenge: None,
                },
                Vec::new(),
            ),
            ApiError::PaymentRequired {
                code,
                message,
                request_id,
                upgrade,
                challenge,
            } => {
                let mut headers = Vec::new();
                if upgrade {
                    headers.push(("X-Payment-Upgrade", "x402".to_string()));
                }
                (
                    ErrorBody {
                        error: message,
                        code: code.into(),
                        request_id,
                        challenge,
                    },
                    headers,
                )
            }
            ApiError::RateLimited {
                retry_after_secs,
                limit,
                remaining,
                reset_secs,
                request_id,
            } => (
                ErrorBody {
                    error: "rate limit exceeded".into(),
                    code: "RATE_LIMITED".into(),
                    request_id,
                    challenge: None,
                },
                vec![
                    ("Retry-After", retry_after_secs.to_string()),
                    ("X-RateLimit-Limit", limit.to_string()),
                    ("X-RateLimit-Remaining", remaining.to_string()),
                    ("X-RateLimit-Reset", reset_secs.to_string()),
                ],
            ),
            ApiError::Unavailable {
                code,
                message,
                request_id,
                retry_after_secs,
            } => {
                let mut headers = Vec::new();
                if let Some(secs) = retry_after_secs {
                    headers.push(("Retry-After", secs.to_string()));
                }
                (
                    ErrorBody {
                        error: message,
                        code: code.into(),
                        request_id,
                        challenge: None,
                    },
                    headers,
                )
            }
        };

        let mut resp = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(code) {
            resp.headers_mut().insert("X-Error-Code", value);
        }
        for (name, value) in extra_headers {
            if let Ok(value) = HeaderValue::from_str(&value) {
                resp.headers_mut().insert(name, value);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
