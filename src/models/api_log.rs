use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One request through `/api/v1`, written after the response is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub endpoint_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiLogRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub endpoint_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status: i16,
    pub latency_ms: i32,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub error_code: Option<String>,
}

/// Per-endpoint usage for one user and month.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EndpointUsage {
    pub endpoint_id: Option<Uuid>,
    pub path: Option<String>,
    pub calls: i64,
    pub credits_spent: Decimal,
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub user_id: Uuid,
    pub month: String,
    pub total_calls: i64,
    pub total_credits: Decimal,
    pub endpoints: Vec<EndpointUsage>,
}

impl UsageSummary {
    pub fn new(user_id: Uuid, month: String, endpoints: Vec<EndpointUsage>) -> Self {
        Self {
            user_id,
            month,
            total_calls: endpoints.iter().map(|e| e.calls).sum(),
            total_credits: endpoints.iter().map(|e| e.credits_spent).sum(),
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_summary_totals() {
        let rows = vec![
            EndpointUsage {
                endpoint_id: Some(Uuid::new_v4()),
                path: Some("/llm/chat".into()),
                calls: 3,
                credits_spent: Decimal::new(750, 2),
            },
            EndpointUsage {
                endpoint_id: Some(Uuid::new_v4()),
                path: Some("/speech/synthesize".into()),
                calls: 2,
                credits_spent: Decimal::new(100, 2),
            },
        ];
        let summary = UsageSummary::new(Uuid::new_v4(), "2026-10".into(), rows);
        assert_eq!(summary.total_calls, 5);
        assert_eq!(summary.total_credits, Decimal::new(850, 2));
    }
}
