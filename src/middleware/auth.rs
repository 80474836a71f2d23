use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, OriginalUri, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, ErrorCode};
use crate::middleware::api_log;
use crate::middleware::rate_limit::{self, RateLimit};
use crate::models::api_log::ApiLogEntry;
use crate::models::secret::{hash_secret, mask};
use crate::models::token::{TokenRow, TokenStatus};
use crate::models::usage::TokenUsage;
use crate::models::user::{Scope, UserRow};
use crate::AppState;

pub const API_KEY_HEADER: &str = "api-key";

const USER_CACHE_TTL_SECS: u64 = 30;

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub user_name: String,
    pub scope: Scope,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.scope.is_admin()
    }
}

impl From<&UserRow> for AuthUser {
    fn from(row: &UserRow) -> Self {
        Self {
            id: row.id,
            user_name: row.user_name.clone(),
            scope: row.scope(),
        }
    }
}

/// Facts only the handler knows (which catalogue row was billed, which token
/// was used). Handlers attach it to the response; the request logger reads it.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub endpoint_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

pub fn user_cache_key(key_hash: &str) -> String {
    format!("user:key:{}", key_hash)
}

pub fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

/// First `X-Forwarded-For` hop, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// Resolve the `API-Key` header to an active user, via the tiered cache.
pub async fn resolve_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    let key = api_key_from_headers(headers).ok_or(AppError::MissingApiKey)?;
    let key_hash = hash_secret(key);
    let cache_key = user_cache_key(&key_hash);

    if let Some(user) = state.cache.get::<AuthUser>(&cache_key).await {
        return Ok(user);
    }

    let row = state
        .db
        .get_user_by_key_hash(&key_hash)
        .await
        .map_err(AppError::Internal)?;
    let Some(row) = row else {
        tracing::warn!(key = %mask(key), "invalid API key presented");
        return Err(AppError::InvalidApiKey);
    };

    let user = AuthUser::from(&row);
    if let Err(e) = state.cache.set(&cache_key, &user, USER_CACHE_TTL_SECS).await {
        tracing::warn!("failed to cache user lookup: {}", e);
    }
    Ok(user)
}

/// Check that `raw` is an active token owned by `user`.
pub async fn validate_token(
    state: &AppState,
    user: &AuthUser,
    raw: Option<&str>,
) -> Result<TokenRow, AppError> {
    let raw = raw
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingToken)?;

    let row = state
        .db
        .get_token_by_hash(&hash_secret(raw))
        .await
        .map_err(AppError::Internal)?
        .filter(|t| t.user_id == user.id)
        .ok_or(AppError::InvalidToken)?;

    match row.status_at(Utc::now()) {
        TokenStatus::Active => Ok(row),
        TokenStatus::Expired => Err(AppError::TokenExpired),
        TokenStatus::Revoked => Err(AppError::InvalidToken),
    }
}

/// Middleware for everything under `/api/v1`: authenticates the `API-Key`
/// header, applies the per-user rate limit, then records the request in
/// `api_logs` and the metrics registry once the response is built.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|u| u.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let client_ip = client_ip(req.headers(), peer);

    let admitted = admit(&state, req.headers()).await;
    let (user_id, response) = match admitted {
        Ok(user) => {
            let user_id = user.id;
            req.extensions_mut().insert(user);
            (Some(user_id), next.run(req).await)
        }
        Err(e) => (None, e.into_response()),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let meta = response.extensions().get::<CallMeta>().cloned().unwrap_or_default();
    let error_code = response.extensions().get::<ErrorCode>().map(|c| c.0.to_string());

    state.metrics.record_request(&method, status, latency_ms);
    if let Some(usage) = &meta.usage {
        state.metrics.record_usage(usage);
    }

    tracing::info!(
        method = %method,
        path = %path,
        status,
        latency_ms,
        user_id = ?user_id,
        "api request"
    );

    api_log::log_async(
        state.db.clone(),
        ApiLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id,
            token_id: meta.token_id,
            endpoint_id: meta.endpoint_id,
            method,
            path,
            status,
            latency_ms,
            user_agent,
            client_ip,
            prompt_tokens: meta.usage.map(|u| u.prompt_tokens),
            completion_tokens: meta.usage.map(|u| u.completion_tokens),
            error_code,
        },
    );

    response
}

async fn admit(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    let user = resolve_user(state, headers).await?;
    let limit = RateLimit {
        max_requests: state.config.default_rate_limit,
        window_secs: state.config.default_rate_limit_window,
    };
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    rate_limit::check_user_rate_limit(&state.cache, user.id, limit, now_secs).await?;
    Ok(user)
}

/// Guard for `/admin/*`: only scope 0 passes. Must run inside `authenticate`.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    match req.extensions().get::<AuthUser>() {
        Some(user) if user.is_admin() => Ok(next.run(req).await),
        Some(user) => {
            tracing::warn!(user_id = %user.id, scope = user.scope.value(), "non-admin attempted admin route");
            Err(AppError::Forbidden("admin scope required".to_string()))
        }
        None => Err(AppError::MissingApiKey),
    }
}
