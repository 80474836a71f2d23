use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use crate::errors::AppError;
use crate::middleware::auth::{authenticate, require_admin};
use crate::proxy::handler as services;
use crate::AppState;

pub mod balance;
pub mod costs;
pub mod endpoints;
pub mod extract;
pub mod logs;
pub mod tokens;
pub mod users;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    /// `(limit, offset)` after bounds checks.
    pub fn resolve(&self) -> Result<(i64, i64), AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AppError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::BadRequest("offset must not be negative".into()));
        }
        Ok((limit, offset))
    }
}

/// Build the `/api/v1` router. Every route runs behind API-key
/// authentication; `/admin/*` additionally requires scope 0.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let admin = Router::new()
        .route("/users", get(users::list_users).post(users::create_user))
        .route(
            "/users/:id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/users/:id/api-key", post(users::rotate_api_key))
        .route(
            "/users/:id/balance",
            get(balance::admin_get_user_balance).post(balance::admin_adjust_balance),
        )
        .route("/balances", get(balance::admin_list_balances))
        .route(
            "/endpoints",
            get(endpoints::admin_list_endpoints).post(endpoints::create_endpoint),
        )
        .route(
            "/endpoints/:id",
            get(endpoints::get_endpoint)
                .patch(endpoints::update_endpoint)
                .delete(endpoints::delete_endpoint),
        )
        .route("/logs", get(logs::admin_list_logs))
        .route("/costs", get(costs::get_costs))
        .route_layer(middleware::from_fn(require_admin));

    Router::new()
        .route(
            "/token",
            post(tokens::issue_token)
                .get(tokens::token_details)
                .delete(tokens::revoke_token),
        )
        .route("/token/refresh", post(tokens::refresh_token))
        .route("/balance", get(balance::get_balance))
        .route("/balance/transactions", get(balance::list_transactions))
        .route("/usage", get(logs::get_usage))
        .route("/endpoints", get(endpoints::list_endpoints))
        .route("/llm/chat/:deployment", post(services::chat_completion))
        .route("/speech/synthesize", post(services::synthesize_speech))
        .route("/speech/transcribe", post(services::transcribe_speech))
        .route("/document/analyze/:model_id", post(services::analyze_document))
        .route(
            "/document/results/:model_id/:result_id",
            get(services::document_result),
        )
        .nest("/admin", admin)
        .fallback(fallback_404)
        .layer(middleware::from_fn_with_state(state, authenticate))
}

async fn fallback_404() -> AppError {
    AppError::NotFound("no such route".into())
}
