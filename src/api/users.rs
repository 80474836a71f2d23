use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::api::Pagination;
use crate::errors::{conflict_or_internal, AppError};
use crate::middleware::auth::{user_cache_key, AuthUser};
use crate::models::secret::generate_api_key;
use crate::models::user::{validate_email, validate_user_name, Scope, UserRow};
use crate::store::postgres::{NewUser, UserUpdate};
use crate::AppState;

// -- Request / Response DTOs --

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub user_name: String,
    pub email: String,
    pub scope: i16,
    pub department: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub scope: Option<i16>,
    pub department: Option<String>,
    pub is_active: Option<bool>,
}

/// A user plus a plaintext API key, returned exactly once.
#[derive(Debug, Serialize)]
pub struct UserWithKey {
    #[serde(flatten)]
    pub user: UserRow,
    pub api_key: String,
}

fn parse_scope(raw: i16) -> Result<Scope, AppError> {
    Scope::new(raw).ok_or_else(|| {
        AppError::BadRequest(format!("scope must be between 0 and {}, got {}", Scope::MAX, raw))
    })
}

impl CreateUserRequest {
    fn validate(&self) -> Result<Scope, AppError> {
        validate_user_name(&self.user_name).map_err(AppError::BadRequest)?;
        validate_email(self.email.trim()).map_err(AppError::BadRequest)?;
        parse_scope(self.scope)
    }
}

impl UpdateUserRequest {
    /// Field validation plus the self-lockout rules for the acting admin.
    fn validate(&self, target: Uuid, actor: &AuthUser) -> Result<(), AppError> {
        if let Some(name) = &self.user_name {
            validate_user_name(name).map_err(AppError::BadRequest)?;
        }
        if let Some(email) = &self.email {
            validate_email(email.trim()).map_err(AppError::BadRequest)?;
        }
        if let Some(scope) = self.scope {
            parse_scope(scope)?;
        }
        if target == actor.id {
            if self.scope.is_some_and(|s| s != Scope::ADMIN.value()) {
                return Err(AppError::BadRequest(
                    "admins cannot remove their own admin scope".into(),
                ));
            }
            if self.is_active == Some(false) {
                return Err(AppError::BadRequest("admins cannot deactivate themselves".into()));
            }
        }
        Ok(())
    }

    fn into_update(self) -> UserUpdate {
        UserUpdate {
            user_name: self.user_name.map(|n| n.trim().to_string()),
            email: self.email.map(|e| e.trim().to_string()),
            department: self.department,
            scope: self.scope,
            is_active: self.is_active,
        }
    }
}

// -- Handlers --

/// POST /api/v1/admin/users: create a user and return its API key.
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiJson(payload): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserWithKey>), AppError> {
    let scope = payload.validate()?;
    let key = generate_api_key();

    let user = state
        .db
        .insert_user(&NewUser {
            user_name: payload.user_name.trim().to_string(),
            email: payload.email.trim().to_string(),
            department: payload.department,
            scope: scope.value(),
            api_key_hash: key.hash,
            api_key_prefix: key.display_prefix,
        })
        .await
        .map_err(|e| conflict_or_internal(e, "user name or email"))?;

    tracing::info!(admin_id = %admin.id, user_id = %user.id, scope = scope.value(), "user created");
    Ok((
        StatusCode::CREATED,
        Json(UserWithKey {
            user,
            api_key: key.plaintext,
        }),
    ))
}

/// GET /api/v1/admin/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    ApiQuery(page): ApiQuery<Pagination>,
) -> Result<Json<Vec<UserRow>>, AppError> {
    let (limit, offset) = page.resolve()?;
    let users = state.db.list_users(limit, offset).await?;
    Ok(Json(users))
}

/// GET /api/v1/admin/users/:id
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<UserRow>, AppError> {
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;
    Ok(Json(user))
}

/// PATCH /api/v1/admin/users/:id
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateUserRequest>,
) -> Result<Json<UserRow>, AppError> {
    payload.validate(id, &admin)?;
    let user = state
        .db
        .update_user(id, &payload.into_update())
        .await
        .map_err(|e| conflict_or_internal(e, "user name or email"))?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;

    // scope or activation may have changed
    state.cache.invalidate(&user_cache_key(&user.api_key_hash)).await;
    tracing::info!(admin_id = %admin.id, user_id = %id, "user updated");
    Ok(Json(user))
}

/// DELETE /api/v1/admin/users/:id: soft delete.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<UserRow>, AppError> {
    if id == admin.id {
        return Err(AppError::BadRequest("admins cannot delete themselves".into()));
    }
    let user = state
        .db
        .deactivate_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;

    state.cache.invalidate(&user_cache_key(&user.api_key_hash)).await;
    tracing::info!(admin_id = %admin.id, user_id = %id, "user deactivated");
    Ok(Json(user))
}

/// POST /api/v1/admin/users/:id/api-key: issue a new key; the old one stops
/// working immediately.
pub async fn rotate_api_key(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<UserWithKey>, AppError> {
    let existing = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;

    let key = generate_api_key();
    let user = state
        .db
        .rotate_api_key(id, &key.hash, &key.display_prefix)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;

    state.cache.invalidate(&user_cache_key(&existing.api_key_hash)).await;
    tracing::info!(admin_id = %admin.id, user_id = %id, "api key rotated");
    Ok(Json(UserWithKey {
        user,
        api_key: key.plaintext,
    }))
}
