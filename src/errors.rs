use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("API-Key header is required")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("token query parameter is required")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("insufficient balance: {required} credits required, {available} available")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("{0} is not configured on this gateway")]
    ServiceNotConfigured(&'static str),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingApiKey
            | AppError::InvalidApiKey
            | AppError::MissingToken
            | AppError::InvalidToken
            | AppError::TokenExpired => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceNotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, also written to `api_logs.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingApiKey => "missing_api_key",
            AppError::InvalidApiKey => "invalid_api_key",
            AppError::MissingToken => "missing_token",
            AppError::InvalidToken => "invalid_token",
            AppError::TokenExpired => "token_expired",
            AppError::Forbidden(_) => "insufficient_scope",
            AppError::BadRequest(_) => "invalid_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InsufficientBalance { .. } => "insufficient_balance",
            AppError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AppError::ServiceNotConfigured(_) => "service_not_configured",
            AppError::Upstream(_) => "upstream_failed",
            AppError::Database(_) | AppError::Internal(_) => "internal_server_error",
        }
    }

    fn error_type(&self) -> &'static str {
        match self.status() {
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::FORBIDDEN => "permission_error",
            StatusCode::PAYMENT_REQUIRED => "billing_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => "upstream_error",
            StatusCode::INTERNAL_SERVER_ERROR => "internal_error",
            _ => "invalid_request_error",
        }
    }
}

/// Marker placed in response extensions so the request logger can record the
/// error code without re-parsing the body.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCode(pub &'static str);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let msg = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "internal server error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": {
                "message": msg,
                "type": self.error_type(),
                "code": self.code(),
            }
        });
        if let AppError::InsufficientBalance { required, available } = &self {
            body["error"]["required"] = json!(required);
            body["error"]["available"] = json!(available);
        }

        let mut response = (self.status(), Json(body)).into_response();

        if let AppError::RateLimitExceeded { retry_after_secs } = &self {
            if let Ok(v) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response.extensions_mut().insert(ErrorCode(self.code()));

        response
    }
}

/// True when the error chain bottoms out in a Postgres unique-constraint
/// violation (duplicate user name, email, endpoint path...).
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .map(|db| db.is_unique_violation())
            .unwrap_or(false)
    })
}

/// Map a store error to 409 when it is a duplicate, 500 otherwise.
pub fn conflict_or_internal(err: anyhow::Error, what: &str) -> AppError {
    if is_unique_violation(&err) {
        AppError::Conflict(format!("{} already exists", what))
    } else {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_and_code_mapping() {
        let cases: Vec<(AppError, StatusCode, &str)> = vec![
            (AppError::MissingApiKey, StatusCode::UNAUTHORIZED, "missing_api_key"),
            (AppError::TokenExpired, StatusCode::UNAUTHORIZED, "token_expired"),
            (AppError::Forbidden("admin".into()), StatusCode::FORBIDDEN, "insufficient_scope"),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST, "invalid_request"),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT, "conflict"),
            (AppError::ServiceNotConfigured("speech"), StatusCode::SERVICE_UNAVAILABLE, "service_not_configured"),
            (AppError::Upstream("boom".into()), StatusCode::BAD_GATEWAY, "upstream_failed"),
        ];
        for (err, status, code) in cases {
            let resp = err.into_response();
            assert_eq!(resp.status(), status);
            let body = body_json(resp).await;
            assert_eq!(body["error"]["code"], code);
        }
    }

    #[tokio::test]
    async fn test_internal_errors_do_not_leak_details() {
        let resp = AppError::Internal(anyhow::anyhow!("password=hunter2 connection refused")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["message"], "internal server error");
        assert!(!body.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_insufficient_balance_reports_amounts() {
        let resp = AppError::InsufficientBalance {
            required: Decimal::new(500, 2),
            available: Decimal::new(125, 2),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["type"], "billing_error");
        assert_eq!(body["error"]["required"], "5.00");
        assert_eq!(body["error"]["available"], "1.25");
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let resp = AppError::RateLimitExceeded { retry_after_secs: 42 }.into_response();
        assert_eq!(resp.headers()["retry-after"], "42");
        assert_eq!(resp.extensions().get::<ErrorCode>().unwrap().0, "rate_limit_exceeded");
    }

    #[test]
    fn test_plain_anyhow_is_not_a_unique_violation() {
        assert!(!is_unique_violation(&anyhow::anyhow!("nope")));
        assert!(matches!(
            conflict_or_internal(anyhow::anyhow!("nope"), "user"),
            AppError::Internal(_)
        ));
    }
}
