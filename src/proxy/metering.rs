use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::errors::{AppError, ErrorCode};
use crate::middleware::auth::{validate_token, AuthUser, CallMeta};
use crate::models::balance::{month_start, ReserveOutcome};
use crate::models::endpoint::{resolution_candidates, EndpointRow};
use crate::store::postgres::Charge;
use crate::AppState;

const ENDPOINT_CACHE_TTL_SECS: u64 = 60;

pub fn endpoint_cache_key(path: &str) -> String {
    format!("endpoint:path:{}", path)
}

/// Active catalogue row billed for `request_path`: the exact path if
/// registered, otherwise the service base path.
pub async fn resolve_endpoint(
    state: &AppState,
    request_path: &str,
    base_path: &str,
) -> Result<EndpointRow, AppError> {
    for candidate in resolution_candidates(request_path, base_path) {
        let key = endpoint_cache_key(&candidate);
        if let Some(row) = state.cache.get::<EndpointRow>(&key).await {
            return Ok(row);
        }
        let found = state
            .db
            .get_active_endpoint_by_path(&candidate)
            .await
            .map_err(AppError::Internal)?;
        if let Some(row) = found {
            if let Err(e) = state.cache.set(&key, &row, ENDPOINT_CACHE_TTL_SECS).await {
                tracing::warn!("failed to cache endpoint lookup: {}", e);
            }
            return Ok(row);
        }
    }
    Err(AppError::NotFound(format!(
        "endpoint {} is not registered",
        request_path
    )))
}

/// Error from a metered call, carrying what is known about the call so the
/// request log still links the token and endpoint.
pub struct MeteredError {
    error: AppError,
    meta: CallMeta,
}

impl From<AppError> for MeteredError {
    fn from(error: AppError) -> Self {
        Self {
            error,
            meta: CallMeta::default(),
        }
    }
}

impl IntoResponse for MeteredError {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        response.extensions_mut().insert(self.meta);
        response
    }
}

/// What came back from Azure, buffered.
pub struct UpstreamReply {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

impl UpstreamReply {
    pub async fn read(resp: reqwest::Response) -> Result<Self, AppError> {
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = resp.headers().clone();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp
            .bytes()
            .await
            .map_err(|e| AppError::Upstream(format!("failed to read upstream body: {}", e)))?;
        Ok(Self {
            status,
            content_type,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Pass status, content type and body through unchanged.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        if let Some(ct) = &self.content_type {
            builder = builder.header(axum::http::header::CONTENT_TYPE, ct.as_str());
        }
        builder
            .body(axum::body::Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

/// A call admitted past authentication, token check and credit reservation.
pub struct MeteredCall {
    user: AuthUser,
    service: &'static str,
    endpoint: EndpointRow,
    token_id: uuid::Uuid,
    month: NaiveDate,
    /// Credits taken for this call; `None` for admins and free endpoints.
    reserved: Option<Decimal>,
}

impl MeteredCall {
    /// Validate the token, resolve the billed endpoint and reserve its cost.
    pub async fn begin(
        state: &AppState,
        user: &AuthUser,
        token: Option<&str>,
        request_path: &str,
        base_path: &str,
        service: &'static str,
    ) -> Result<Self, MeteredError> {
        let token = validate_token(state, user, token).await?;
        let partial = CallMeta {
            token_id: Some(token.id),
            ..CallMeta::default()
        };

        let endpoint = resolve_endpoint(state, request_path, base_path)
            .await
            .map_err(|error| MeteredError {
                error,
                meta: partial.clone(),
            })?;

        let mut call = Self {
            user: user.clone(),
            service,
            token_id: token.id,
            month: month_start(Utc::now(), state.config.timezone),
            reserved: None,
            endpoint,
        };

        if user.is_admin() || call.endpoint.cost.is_zero() {
            return Ok(call);
        }

        let description = format!("{} {}", service, request_path);
        let charge = call.charge(call.endpoint.cost, &description);
        let outcome = state
            .db
            .reserve_credits(&charge)
            .await
            .map_err(|e| call.error(AppError::Internal(e)))?;

        match outcome {
            ReserveOutcome::Free => {}
            ReserveOutcome::Reserved(tx) => {
                tracing::debug!(
                    user_id = %user.id,
                    endpoint = %call.endpoint.path,
                    balance_after = %tx.balance_after,
                    "credits reserved"
                );
                call.reserved = Some(call.endpoint.cost);
            }
            ReserveOutcome::Insufficient { available } => {
                tracing::info!(
                    user_id = %user.id,
                    endpoint = %call.endpoint.path,
                    required = %call.endpoint.cost,
                    %available,
                    "insufficient balance"
                );
                return Err(call.error(AppError::InsufficientBalance {
                    required: call.endpoint.cost,
                    available,
                }));
            }
        }
        Ok(call)
    }

    fn charge<'a>(&self, amount: Decimal, description: &'a str) -> Charge<'a> {
        Charge {
            user_id: self.user.id,
            month: self.month,
            allocation: self.user.scope.monthly_allocation().unwrap_or(Decimal::ZERO),
            endpoint_id: Some(self.endpoint.id),
            amount,
            description: Some(description),
        }
    }

    pub fn meta(&self) -> CallMeta {
        CallMeta {
            endpoint_id: Some(self.endpoint.id),
            token_id: Some(self.token_id),
            usage: None,
        }
    }

    fn error(&self, error: AppError) -> MeteredError {
        MeteredError {
            error,
            meta: self.meta(),
        }
    }

    /// Give the reserved credits back after a failed upstream call.
    async fn refund(&self, state: &AppState, reason: &str) {
        state.metrics.record_upstream_failure(self.service);
        let Some(amount) = self.reserved else {
            return;
        };
        let description = format!("refund: {}", reason);
        match state.db.refund_credits(&self.charge(amount, &description)).await {
            Ok(tx) => tracing::info!(
                user_id = %self.user.id,
                endpoint = %self.endpoint.path,
                %amount,
                balance_after = %tx.balance_after,
                "credits refunded after upstream failure"
            ),
            Err(e) => tracing::error!(
                user_id = %self.user.id,
                endpoint = %self.endpoint.path,
                %amount,
                "failed to refund credits: {}",
                e
            ),
        }
    }

    /// Buffer the upstream response, refunding when the call failed.
    pub async fn settle(
        &self,
        state: &AppState,
        result: Result<reqwest::Response, AppError>,
    ) -> Result<UpstreamReply, MeteredError> {
        let reply = match result {
            Ok(resp) => UpstreamReply::read(resp).await,
            Err(e) => Err(e),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.refund(state, "transport error").await;
                return Err(self.error(e));
            }
        };

        if reply.status.is_success() {
            if let Some(amount) = self.reserved {
                state.metrics.record_credits(self.service, amount);
            }
        } else {
            tracing::warn!(
                service = self.service,
                status = reply.status.as_u16(),
                "upstream returned an error status"
            );
            self.refund(state, &format!("upstream status {}", reply.status.as_u16()))
                .await;
        }
        Ok(reply)
    }

    /// Undo the reservation for a reply that looked successful but is unusable.
    pub async fn fail(&self, state: &AppState, error: AppError) -> MeteredError {
        self.refund(state, "unusable upstream response").await;
        self.error(error)
    }

    /// Attach call metadata (and an error code for relayed upstream
    /// failures) to the final response.
    pub fn finish(&self, mut response: Response, meta: CallMeta) -> Response {
        if !response.status().is_success() {
            response
                .extensions_mut()
                .insert(ErrorCode("upstream_rejected"));
        }
        response.extensions_mut().insert(meta);
        response
    }
}
