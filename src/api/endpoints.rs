use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::extract::{ApiJson, ApiPath};
use crate::errors::{conflict_or_internal, AppError};
use crate::middleware::auth::AuthUser;
use crate::models::endpoint::{normalize_path, validate_cost, EndpointRow};
use crate::proxy::metering::endpoint_cache_key;
use crate::store::postgres::EndpointUpdate;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub path: String,
    pub cost: Decimal,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateEndpointRequest {
    pub path: Option<String>,
    pub cost: Option<Decimal>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

impl UpdateEndpointRequest {
    fn into_update(self) -> Result<EndpointUpdate, AppError> {
        Ok(EndpointUpdate {
            path: self
                .path
                .as_deref()
                .map(normalize_path)
                .transpose()
                .map_err(AppError::BadRequest)?,
            cost: self
                .cost
                .map(validate_cost)
                .transpose()
                .map_err(AppError::BadRequest)?,
            description: self.description,
            is_active: self.is_active,
        })
    }
}

/// Catalogue entry as shown to non-admin callers.
#[derive(Debug, Serialize)]
pub struct PublicEndpoint {
    pub path: String,
    pub description: String,
    pub cost: Decimal,
}

impl From<EndpointRow> for PublicEndpoint {
    fn from(row: EndpointRow) -> Self {
        Self {
            path: row.path,
            description: row.description,
            cost: row.cost,
        }
    }
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("endpoint {} not found", id))
}

/// GET /api/v1/endpoints: active endpoints and their per-call cost.
pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PublicEndpoint>>, AppError> {
    let rows = state.db.list_endpoints(true).await?;
    Ok(Json(rows.into_iter().map(PublicEndpoint::from).collect()))
}

/// GET /api/v1/admin/endpoints: every endpoint, including inactive ones.
pub async fn admin_list_endpoints(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EndpointRow>>, AppError> {
    Ok(Json(state.db.list_endpoints(false).await?))
}

/// POST /api/v1/admin/endpoints
pub async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiJson(payload): ApiJson<CreateEndpointRequest>,
) -> Result<(StatusCode, Json<EndpointRow>), AppError> {
    let path = normalize_path(&payload.path).map_err(AppError::BadRequest)?;
    let cost = validate_cost(payload.cost).map_err(AppError::BadRequest)?;

    let row = state
        .db
        .insert_endpoint(&path, payload.description.trim(), cost)
        .await
        .map_err(|e| conflict_or_internal(e, "endpoint path"))?;

    tracing::info!(admin_id = %admin.id, endpoint = %row.path, cost = %row.cost, "endpoint registered");
    Ok((StatusCode::CREATED, Json(row)))
}

/// GET /api/v1/admin/endpoints/:id
pub async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<EndpointRow>, AppError> {
    let row = state.db.get_endpoint(id).await?.ok_or_else(|| not_found(id))?;
    Ok(Json(row))
}

/// PATCH /api/v1/admin/endpoints/:id
pub async fn update_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateEndpointRequest>,
) -> Result<Json<EndpointRow>, AppError> {
    let update = payload.into_update()?;
    let before = state.db.get_endpoint(id).await?.ok_or_else(|| not_found(id))?;
    let row = state
        .db
        .update_endpoint(id, &update)
        .await
        .map_err(|e| conflict_or_internal(e, "endpoint path"))?
        .ok_or_else(|| not_found(id))?;

    // the old and new paths may both be cached
    state.cache.invalidate(&endpoint_cache_key(&before.path)).await;
    state.cache.invalidate(&endpoint_cache_key(&row.path)).await;
    tracing::info!(admin_id = %admin.id, endpoint = %row.path, cost = %row.cost, "endpoint updated");
    Ok(Json(row))
}

/// DELETE /api/v1/admin/endpoints/:id: soft delete.
pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<EndpointRow>, AppError> {
    let row = state
        .db
        .deactivate_endpoint(id)
        .await?
        .ok_or_else(|| not_found(id))?;
    state.cache.invalidate(&endpoint_cache_key(&row.path)).await;
    tracing::info!(admin_id = %admin.id, endpoint = %row.path, "endpoint deactivated");
    Ok(Json(row))
}
