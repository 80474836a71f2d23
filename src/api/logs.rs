use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::balance::MonthQuery;
use crate::api::extract::ApiQuery;
use crate::api::Pagination;
use crate::errors::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::api_log::{ApiLogRow, UsageSummary};
use crate::models::balance::month_bounds_utc;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/v1/usage?month=YYYY-MM: per-endpoint calls and credits for the
/// caller.
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(query): ApiQuery<MonthQuery>,
) -> Result<Json<UsageSummary>, AppError> {
    let month = query.resolve(&state)?;
    let (from, to) = month_bounds_utc(month, state.config.timezone);
    let endpoints = state.db.usage_summary(user.id, month, from, to).await?;
    Ok(Json(UsageSummary::new(
        user.id,
        month.format("%Y-%m").to_string(),
        endpoints,
    )))
}

/// GET /api/v1/admin/logs: newest request log rows, optionally for one user.
pub async fn admin_list_logs(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<LogQuery>,
) -> Result<Json<Vec<ApiLogRow>>, AppError> {
    let (limit, offset) = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .resolve()?;
    let rows = state.db.list_api_logs(query.user_id, limit, offset).await?;
    Ok(Json(rows))
}
