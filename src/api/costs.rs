use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::api::extract::ApiQuery;
use crate::errors::AppError;
use crate::proxy::azure::{validate_cost_range, CostReport};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CostResponse {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(flatten)]
    pub report: CostReport,
}

fn parse_date(name: &str, raw: Option<&str>) -> Result<NaiveDate, AppError> {
    let raw = raw.ok_or_else(|| AppError::BadRequest(format!("'{}' is required", name)))?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        AppError::BadRequest(format!("'{}' must be a date in YYYY-MM-DD format", name))
    })
}

/// GET /api/v1/admin/costs?from=&to=: Azure spend per service.
pub async fn get_costs(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<CostQuery>,
) -> Result<Json<CostResponse>, AppError> {
    let from = parse_date("from", query.from.as_deref())?;
    let to = parse_date("to", query.to.as_deref())?;
    validate_cost_range(from, to)?;

    let client = state
        .cost_client
        .as_ref()
        .ok_or(AppError::ServiceNotConfigured("cost management"))?;
    let report = client.query_costs(&state.upstream_client, from, to).await?;
    tracing::info!(%from, %to, rows = report.rows.len(), "cost report fetched");
    Ok(Json(CostResponse { from, to, report }))
}
