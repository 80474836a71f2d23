use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::api::Pagination;
use crate::errors::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::balance::{
    month_start, parse_month, validate_adjustment, BalanceTransactionRow, BalanceView, MAX_BALANCE,
};
use crate::models::user::Scope;
use crate::store::postgres::Charge;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct MonthQuery {
    pub month: Option<String>,
}

impl MonthQuery {
    /// Requested month, or the current one in the gateway's zone.
    pub fn resolve(&self, state: &AppState) -> Result<NaiveDate, AppError> {
        match &self.month {
            Some(raw) => parse_month(raw).map_err(AppError::BadRequest),
            None => Ok(month_start(Utc::now(), state.config.timezone)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustBalanceRequest {
    pub amount: Decimal,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdjustBalanceResponse {
    pub balance: BalanceView,
    pub transaction: BalanceTransactionRow,
}

/// Current month's balance for a user, creating the row on first access.
async fn current_view(state: &AppState, user_id: Uuid, scope: Scope) -> Result<BalanceView, AppError> {
    let month = month_start(Utc::now(), state.config.timezone);
    let Some(allocation) = scope.monthly_allocation() else {
        return Ok(BalanceView::unlimited(user_id, month));
    };
    let row = state
        .db
        .ensure_monthly_balance(user_id, month, allocation)
        .await?;
    Ok(BalanceView::from(&row))
}

/// GET /api/v1/balance: the caller's balance for the current month.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<BalanceView>, AppError> {
    Ok(Json(current_view(&state, user.id, user.scope).await?))
}

/// GET /api/v1/balance/transactions: the caller's credit history, newest first.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(page): ApiQuery<Pagination>,
) -> Result<Json<Vec<BalanceTransactionRow>>, AppError> {
    let (limit, offset) = page.resolve()?;
    let rows = state.db.list_transactions(user.id, limit, offset).await?;
    Ok(Json(rows))
}

/// GET /api/v1/admin/users/:id/balance
pub async fn admin_get_user_balance(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<BalanceView>, AppError> {
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;
    Ok(Json(current_view(&state, user.id, user.scope()).await?))
}

/// POST /api/v1/admin/users/:id/balance: apply a signed credit adjustment to
/// the current month.
pub async fn admin_adjust_balance(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<AdjustBalanceRequest>,
) -> Result<Json<AdjustBalanceResponse>, AppError> {
    let amount = validate_adjustment(payload.amount).map_err(AppError::BadRequest)?;
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;
    let Some(allocation) = user.scope().monthly_allocation() else {
        return Err(AppError::BadRequest("admin users have no balance to adjust".into()));
    };

    let description = payload
        .description
        .clone()
        .unwrap_or_else(|| format!("adjustment by {}", admin.user_name));
    let charge = Charge {
        user_id: user.id,
        month: month_start(Utc::now(), state.config.timezone),
        allocation,
        endpoint_id: None,
        amount,
        description: Some(&description),
    };
    let (balance, transaction) = state
        .db
        .adjust_balance(&charge)
        .await?
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "adjustment would take the balance below zero or to {} or more",
                MAX_BALANCE
            ))
        })?;

    tracing::info!(
        admin_id = %admin.id,
        user_id = %user.id,
        amount = %amount,
        balance_after = %balance.current_balance,
        "balance adjusted"
    );
    Ok(Json(AdjustBalanceResponse {
        balance: BalanceView::from(&balance),
        transaction,
    }))
}

/// GET /api/v1/admin/balances?month=YYYY-MM
pub async fn admin_list_balances(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<MonthQuery>,
) -> Result<Json<Vec<BalanceView>>, AppError> {
    let month = query.resolve(&state)?;
    let rows = state.db.list_balances(month).await?;
    Ok(Json(rows.iter().map(BalanceView::from).collect()))
}
