use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::api::extract::ApiQuery;
use crate::errors::AppError;
use crate::middleware::auth::{validate_token, AuthUser, CallMeta, TokenQuery};
use crate::models::secret::{generate_token, hash_secret};
use crate::models::token::{IssuedToken, TokenDetails, TokenRow};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

fn with_token_meta(body: impl IntoResponse, token_id: Uuid) -> Response {
    let mut response = body.into_response();
    response.extensions_mut().insert(CallMeta {
        token_id: Some(token_id),
        ..CallMeta::default()
    });
    response
}

/// The caller's own token, whatever its status. Tokens belonging to someone
/// else are reported as missing.
async fn owned_token(state: &AppState, user: &AuthUser, raw: Option<&str>) -> Result<TokenRow, AppError> {
    let raw = raw
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingToken)?;
    state
        .db
        .get_token_by_hash(&hash_secret(raw))
        .await?
        .filter(|t| t.user_id == user.id)
        .ok_or_else(|| AppError::NotFound("token not found".into()))
}

/// POST /api/v1/token: issue a bearer token for the API key's owner.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response, AppError> {
    let secret = generate_token();
    let now = Utc::now();
    let expires_at = now + Duration::seconds(state.config.token_ttl_secs);
    let row = state.db.insert_token(user.id, &secret.hash, expires_at).await?;

    tracing::info!(user_id = %user.id, token_id = %row.id, %expires_at, "token issued");
    let body = IssuedToken::new(secret.plaintext, &row, state.config.timezone, now);
    Ok(with_token_meta((StatusCode::CREATED, Json(body)), row.id))
}

/// GET /api/v1/token?token=: status and expiry of one of the caller's tokens.
pub async fn token_details(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<TokenQuery>,
) -> Result<Response, AppError> {
    let row = owned_token(&state, &user, query.token.as_deref()).await?;
    let details = TokenDetails::new(&row, state.config.timezone, Utc::now());
    Ok(with_token_meta(Json(details), row.id))
}

/// DELETE /api/v1/token?token=
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<TokenQuery>,
) -> Result<Response, AppError> {
    let row = owned_token(&state, &user, query.token.as_deref()).await?;
    let revoked = state.db.revoke_token(&row).await?;
    if revoked {
        tracing::info!(user_id = %user.id, token_id = %row.id, "token revoked");
    }
    Ok(with_token_meta(Json(RevokeResponse { revoked }), row.id))
}

/// POST /api/v1/token/refresh?token=: swap an active token for a fresh one.
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<TokenQuery>,
) -> Result<Response, AppError> {
    let old = validate_token(&state, &user, query.token.as_deref()).await?;

    let secret = generate_token();
    let now = Utc::now();
    let expires_at = now + Duration::seconds(state.config.token_ttl_secs);
    let row = state
        .db
        .rotate_token(&old, &secret.hash, expires_at)
        .await?
        // lost a race with a concurrent revoke/refresh
        .ok_or(AppError::InvalidToken)?;

    tracing::info!(user_id = %user.id, old_token_id = %old.id, token_id = %row.id, "token refreshed");
    let body = IssuedToken::new(secret.plaintext, &row, state.config.timezone, now);
    Ok(with_token_meta(Json(body), row.id))
}
