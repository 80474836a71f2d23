use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenRow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Expired,
    Revoked,
}

impl TokenRow {
    /// Expiry is compared in UTC; the display zone never affects validity.
    pub fn status_at(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.revoked_at.is_some() {
            TokenStatus::Revoked
        } else if now >= self.expires_at {
            TokenStatus::Expired
        } else {
            TokenStatus::Active
        }
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.status_at(now) {
            TokenStatus::Active => (self.expires_at - now).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// Audit trail entry kinds for `token_transactions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    Issued,
    Refreshed,
    Revoked,
}

impl TokenAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenAction::Issued => "issued",
            TokenAction::Refreshed => "refreshed",
            TokenAction::Revoked => "revoked",
        }
    }
}

/// Response body for issue/refresh.
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub expires_on: DateTime<Utc>,
    pub expires_on_local: String,
    pub timezone: String,
}

impl IssuedToken {
    pub fn new(plaintext: String, row: &TokenRow, tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            access_token: plaintext,
            token_type: "Bearer",
            expires_in: row.seconds_remaining(now),
            expires_on: row.expires_at,
            expires_on_local: to_local(row.expires_at, tz),
            timezone: tz.name().to_string(),
        }
    }
}

/// Response body for the details endpoint.
#[derive(Debug, Serialize)]
pub struct TokenDetails {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
    pub expires_on_local: String,
    pub status: TokenStatus,
    pub seconds_remaining: i64,
}

impl TokenDetails {
    pub fn new(row: &TokenRow, tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            token_id: row.id,
            user_id: row.user_id,
            created_at: row.created_at,
            expires_on: row.expires_at,
            expires_on_local: to_local(row.expires_at, tz),
            status: row.status_at(now),
            seconds_remaining: row.seconds_remaining(now),
        }
    }
}

pub fn to_local(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn token(expires_at: DateTime<Utc>) -> TokenRow {
        TokenRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "h".into(),
            expires_at,
            revoked_at: None,
            created_at: expires_at - Duration::hours(1),
        }
    }

    #[test]
    fn test_status_transitions_at_expiry_instant() {
        let exp = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let t = token(exp);
        assert_eq!(t.status_at(exp - Duration::seconds(1)), TokenStatus::Active);
        assert_eq!(t.status_at(exp), TokenStatus::Expired);
        assert_eq!(t.status_at(exp + Duration::days(3)), TokenStatus::Expired);
    }

    #[test]
    fn test_revoked_wins_over_expiry() {
        let exp = Utc::now() + Duration::hours(1);
        let mut t = token(exp);
        t.revoked_at = Some(Utc::now());
        assert_eq!(t.status_at(Utc::now()), TokenStatus::Revoked);
        assert_eq!(t.seconds_remaining(Utc::now()), 0);
    }

    #[test]
    fn test_seconds_remaining() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 11, 30, 0).unwrap();
        let t = token(now + Duration::minutes(30));
        assert_eq!(t.seconds_remaining(now), 1800);
        assert_eq!(t.seconds_remaining(now + Duration::hours(2)), 0);
    }

    #[test]
    fn test_local_rendering_does_not_change_instant() {
        let exp = Utc.with_ymd_and_hms(2026, 3, 1, 22, 30, 0).unwrap();
        let local = to_local(exp, chrono_tz::Africa::Johannesburg);
        assert_eq!(local, "2026-03-02T00:30:00+02:00");
        let parsed = DateTime::parse_from_rfc3339(&local).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), exp);
    }

    #[test]
    fn test_issued_token_body() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let row = token(now + Duration::hours(1));
        let issued = IssuedToken::new("aiapi_tok_x".into(), &row, chrono_tz::UTC, now);
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["token_type"], "Bearer");
        assert_eq!(json["expires_in"], 3600);
        assert_eq!(json["timezone"], "UTC");
        assert!(json.get("token_hash").is_none());
    }
}
