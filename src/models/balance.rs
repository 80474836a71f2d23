use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BalanceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance_month: NaiveDate,
    pub allocated: Decimal,
    pub current_balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Allocation,
    Deduction,
    Refund,
    AdminAdjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BalanceTransactionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint_id: Option<Uuid>,
    pub balance_month: NaiveDate,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an attempt to take credits from a monthly balance.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// Nothing to charge (free endpoint).
    Free,
    Reserved(BalanceTransactionRow),
    Insufficient { available: Decimal },
}

/// First day of the balance month containing `now`, as seen in `tz`.
pub fn month_start(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let local = now.with_timezone(&tz);
    NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
        .unwrap_or_else(|| local.date_naive())
}

/// Parse a `YYYY-MM` month selector into its first day.
pub fn parse_month(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d")
        .map_err(|_| format!("invalid month '{}', expected YYYY-MM", raw))
}

/// First day of the month after `month`.
pub fn next_month(month: NaiveDate) -> NaiveDate {
    let (y, m) = if month.month() == 12 {
        (month.year() + 1, 1)
    } else {
        (month.year(), month.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(month)
}

/// UTC instants bounding the balance month `month` as seen in `tz`.
pub fn month_bounds_utc(month: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_of = |day: NaiveDate| {
        let midnight = day.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    };
    (start_of(month), start_of(next_month(month)))
}

/// Balance left after charging `cost`, or the shortfall as an error.
pub fn plan_deduction(current: Decimal, cost: Decimal) -> Result<Decimal, Decimal> {
    if current >= cost {
        Ok(current - cost)
    } else {
        Err(current)
    }
}

/// Exclusive upper bound for a stored balance and for a single admin
/// adjustment; balances are NUMERIC(14, 2).
pub const MAX_BALANCE: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Check an admin delta and strip trailing zeros from it.
pub fn validate_adjustment(amount: Decimal) -> Result<Decimal, String> {
    let amount = amount.normalize();
    if amount.is_zero() {
        return Err("amount must not be zero".into());
    }
    if amount.scale() > 2 {
        return Err(format!("amount supports at most 2 decimal places, got {}", amount));
    }
    if amount.abs() >= MAX_BALANCE {
        return Err(format!("amount must be below {} in absolute value", MAX_BALANCE));
    }
    Ok(amount)
}

/// Balance after applying a signed admin delta; `None` when it would go
/// below zero or reach `MAX_BALANCE`.
pub fn apply_adjustment(current: Decimal, delta: Decimal) -> Option<Decimal> {
    let next = current.checked_add(delta)?;
    if (next.is_sign_negative() && !next.is_zero()) || next >= MAX_BALANCE {
        None
    } else {
        Some(next)
    }
}

/// Balance summary returned to clients.
#[derive(Debug, Serialize)]
pub struct BalanceView {
    pub user_id: Uuid,
    pub month: String,
    pub unlimited: bool,
    pub allocated: Option<Decimal>,
    pub current_balance: Option<Decimal>,
    pub used: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BalanceView {
    pub fn unlimited(user_id: Uuid, month: NaiveDate) -> Self {
        Self {
            user_id,
            month: month.format("%Y-%m").to_string(),
            unlimited: true,
            allocated: None,
            current_balance: None,
            used: None,
            updated_at: None,
        }
    }
}

impl From<&BalanceRow> for BalanceView {
    fn from(row: &BalanceRow) -> Self {
        Self {
            user_id: row.user_id,
            month: row.balance_month.format("%Y-%m").to_string(),
            unlimited: false,
            allocated: Some(row.allocated),
            current_balance: Some(row.current_balance),
            used: Some((row.allocated - row.current_balance).max(Decimal::ZERO)),
            updated_at: Some(row.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_month_start_respects_timezone() {
        // 23:30 UTC on Jan 31 is already Feb 1 in Johannesburg (UTC+2).
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 23, 30, 0).unwrap();
        assert_eq!(month_start(now, chrono_tz::UTC), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(
            month_start(now, chrono_tz::Africa::Johannesburg),
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
        );
    }

    #[test]
    fn test_parse_month() {
        assert_eq!(parse_month("2026-10").unwrap(), NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());
        assert!(parse_month("2026-13").is_err());
        assert!(parse_month("October").is_err());
    }

    #[test]
    fn test_next_month_rolls_year() {
        let dec = NaiveDate::from_ymd_opt(2026, 12, 1).unwrap();
        assert_eq!(next_month(dec), NaiveDate::from_ymd_opt(2027, 1, 1).unwrap());
        let jun = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        assert_eq!(next_month(jun), NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
    }

    #[test]
    fn test_month_bounds_in_local_zone() {
        let oct = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        let (start, end) = month_bounds_utc(oct, chrono_tz::Africa::Johannesburg);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 9, 30, 22, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 10, 31, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_plan_deduction() {
        assert_eq!(plan_deduction(d("10.00"), d("2.50")), Ok(d("7.50")));
        assert_eq!(plan_deduction(d("2.50"), d("2.50")), Ok(d("0.00")));
        assert_eq!(plan_deduction(d("2.49"), d("2.50")), Err(d("2.49")));
    }

    #[test]
    fn test_apply_adjustment() {
        assert_eq!(apply_adjustment(d("10"), d("5")), Some(d("15")));
        assert_eq!(apply_adjustment(d("10"), d("-10")), Some(d("0")));
        assert_eq!(apply_adjustment(d("10"), d("-10.01")), None);
    }

    #[test]
    fn test_max_balance_is_ten_to_the_twelfth() {
        assert_eq!(MAX_BALANCE, d("1000000000000"));
    }

    #[test]
    fn test_apply_adjustment_never_overflows() {
        assert_eq!(apply_adjustment(d("1000"), Decimal::MAX), None);
        assert_eq!(apply_adjustment(d("1000"), Decimal::MIN), None);
        assert_eq!(apply_adjustment(d("999999999999"), d("1")), None);
        assert_eq!(apply_adjustment(d("999999999999"), d("0.99")), Some(d("999999999999.99")));
    }

    #[test]
    fn test_validate_adjustment() {
        assert_eq!(validate_adjustment(d("-25.50")), Ok(d("-25.5")));
        assert!(validate_adjustment(d("100")).is_ok());
        // trailing zeros beyond two places are harmless
        assert_eq!(validate_adjustment(d("1.5000")), Ok(d("1.5")));
        assert!(validate_adjustment(Decimal::ZERO).is_err());
        assert!(validate_adjustment(d("0.001")).is_err());
        assert!(validate_adjustment(d("999999999999.99")).is_ok());
        assert!(validate_adjustment(d("1000000000000")).is_err());
        assert!(validate_adjustment(d("-10000000000000")).is_err());
        assert!(validate_adjustment(Decimal::MAX).is_err());
    }

    #[test]
    fn test_balance_view_used_never_negative() {
        let row = BalanceRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            balance_month: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            allocated: d("100"),
            // An admin top-up can push the balance above the allocation.
            current_balance: d("150"),
            updated_at: Utc::now(),
        };
        let view = BalanceView::from(&row);
        assert_eq!(view.month, "2026-10");
        assert_eq!(view.used, Some(Decimal::ZERO));
        assert!(!view.unlimited);
    }

    #[test]
    fn test_transaction_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransactionKind::AdminAdjustment).unwrap(),
            "\"admin_adjustment\""
        );
    }
}
