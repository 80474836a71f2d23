use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A callable route and its per-call credit cost.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EndpointRow {
    pub id: Uuid,
    pub path: String,
    pub description: String,
    pub cost: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[A-Za-z0-9/_\-.]*$").expect("path regex is valid"));

/// Normalise and validate an endpoint path: leading slash, restricted
/// charset, no trailing slash (except the root itself).
pub fn normalize_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if !PATH_RE.is_match(trimmed) {
        return Err(format!(
            "invalid endpoint path '{}': must start with '/' and contain only letters, digits, '/', '_', '-', '.'",
            raw
        ));
    }
    if trimmed.contains("//") {
        return Err(format!("invalid endpoint path '{}': empty segment", raw));
    }
    let normalized = if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    };
    Ok(normalized.to_string())
}

/// Exclusive upper bound for a per-call cost; costs are NUMERIC(12, 2).
pub const MAX_COST: Decimal = Decimal::from_parts(1_410_065_408, 2, 0, false, 0);

/// Check a per-call cost and strip trailing zeros from it.
pub fn validate_cost(cost: Decimal) -> Result<Decimal, String> {
    let cost = cost.normalize();
    if cost.is_sign_negative() && !cost.is_zero() {
        return Err(format!("cost must not be negative, got {}", cost));
    }
    if cost.scale() > 2 {
        return Err(format!("cost supports at most 2 decimal places, got {}", cost));
    }
    if cost >= MAX_COST {
        return Err(format!("cost must be below {}, got {}", MAX_COST, cost));
    }
    Ok(cost)
}

/// Candidate catalogue paths for a metered request, most specific first.
/// `/llm/chat/gpt-4o` is billed as itself when registered, otherwise as the
/// service base path `/llm/chat`.
pub fn resolution_candidates(request_path: &str, base_path: &str) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);
    candidates.push(request_path.trim_end_matches('/').to_string());
    if base_path != request_path {
        candidates.push(base_path.to_string());
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/llm/chat").unwrap(), "/llm/chat");
        assert_eq!(normalize_path(" /llm/chat/ ").unwrap(), "/llm/chat");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("llm/chat").is_err());
        assert!(normalize_path("/llm chat").is_err());
        assert!(normalize_path("/llm//chat").is_err());
        assert!(normalize_path("/llm/chat?x=1").is_err());
    }

    #[test]
    fn test_validate_cost() {
        assert!(validate_cost(Decimal::ZERO).is_ok());
        assert!(validate_cost(Decimal::from_str("2.50").unwrap()).is_ok());
        assert!(validate_cost(Decimal::from_str("-1").unwrap()).is_err());
        assert!(validate_cost(Decimal::from_str("0.001").unwrap()).is_err());
    }

    #[test]
    fn test_validate_cost_accepts_trailing_zeros() {
        let cost = validate_cost(Decimal::from_str("2.500").unwrap()).unwrap();
        assert_eq!(cost, Decimal::from_str("2.5").unwrap());
        assert!(validate_cost(Decimal::from_str("0.0100").unwrap()).is_ok());
        assert!(validate_cost(Decimal::from_str("0.0150").unwrap()).is_err());
    }

    #[test]
    fn test_validate_cost_upper_bound() {
        assert_eq!(MAX_COST, Decimal::from_str("10000000000").unwrap());
        assert!(validate_cost(Decimal::from_str("9999999999.99").unwrap()).is_ok());
        assert!(validate_cost(Decimal::from_str("10000000000").unwrap()).is_err());
        assert!(validate_cost(Decimal::from_str("100000000000").unwrap()).is_err());
        assert!(validate_cost(Decimal::MAX).is_err());
    }

    #[test]
    fn test_resolution_candidates() {
        assert_eq!(
            resolution_candidates("/llm/chat/gpt-4o", "/llm/chat"),
            vec!["/llm/chat/gpt-4o".to_string(), "/llm/chat".to_string()]
        );
        assert_eq!(
            resolution_candidates("/speech/synthesize", "/speech/synthesize"),
            vec!["/speech/synthesize".to_string()]
        );
    }
}
