use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Privilege and credit tier of a user. 0 is admin; 1..=5 are metered tiers
/// with decreasing monthly allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub struct Scope(u8);

impl Scope {
    pub const ADMIN: Scope = Scope(0);
    pub const MAX: u8 = 5;

    pub fn new(value: i16) -> Option<Self> {
        if (0..=Self::MAX as i16).contains(&value) {
            Some(Scope(value as u8))
        } else {
            None
        }
    }

    pub fn value(self) -> i16 {
        self.0 as i16
    }

    pub fn is_admin(self) -> bool {
        self.0 == 0
    }

    /// Credits granted at the start of each balance month.
    /// `None` for admins, who are never metered.
    pub fn monthly_allocation(self) -> Option<Decimal> {
        let credits: i64 = match self.0 {
            0 => return None,
            1 => 100_000,
            2 => 50_000,
            3 => 25_000,
            4 => 10_000,
            _ => 1_000,
        };
        Some(Decimal::from(credits))
    }
}

impl TryFrom<i16> for Scope {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Scope::new(value).ok_or_else(|| format!("scope must be between 0 and {}, got {}", Scope::MAX, value))
    }
}

impl From<Scope> for i16 {
    fn from(scope: Scope) -> i16 {
        scope.value()
    }
}

/// A user as stored. The API key hash never leaves the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub department: Option<String>,
    pub scope: i16,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    /// Rows violating the CHECK constraint cannot exist; fall back to the
    /// most restrictive tier rather than granting admin.
    pub fn scope(&self) -> Scope {
        Scope::new(self.scope).unwrap_or(Scope(Scope::MAX))
    }
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
});

pub fn validate_email(email: &str) -> Result<(), String> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(format!("invalid email address: '{}'", email))
    }
}

pub fn validate_user_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("user_name must not be empty".to_string());
    }
    if trimmed.len() > 100 {
        return Err("user_name must be at most 100 characters".to_string());
    }
    Ok(())
}
