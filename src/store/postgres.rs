use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::api_log::{ApiLogEntry, ApiLogRow, EndpointUsage};
use crate::models::balance::{
    plan_deduction, BalanceRow, BalanceTransactionRow, ReserveOutcome, TransactionKind,
};
use crate::models::endpoint::EndpointRow;
use crate::models::token::{TokenAction, TokenRow};
use crate::models::user::UserRow;

const USER_COLUMNS: &str = "id, user_name, email, department, scope, api_key_hash, api_key_prefix, is_active, created_at, updated_at";
const TOKEN_COLUMNS: &str = "id, user_id, token_hash, expires_at, revoked_at, created_at";
const ENDPOINT_COLUMNS: &str = "id, path, description, cost, is_active, created_at, updated_at";
const BALANCE_COLUMNS: &str = "id, user_id, balance_month, allocated, current_balance, updated_at";
const TX_COLUMNS: &str = "id, user_id, endpoint_id, balance_month, kind, amount, balance_after, description, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub struct NewUser {
    pub user_name: String,
    pub email: String,
    pub department: Option<String>,
    pub scope: i16,
    pub api_key_hash: String,
    pub api_key_prefix: String,
}

/// Partial update; `None` leaves the column unchanged.
#[derive(Debug, Default)]
pub struct UserUpdate {
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub scope: Option<i16>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default)]
pub struct EndpointUpdate {
    pub path: Option<String>,
    pub description: Option<String>,
    pub cost: Option<Decimal>,
    pub is_active: Option<bool>,
}

/// A credit movement to record against a monthly balance.
pub struct Charge<'a> {
    pub user_id: Uuid,
    pub month: NaiveDate,
    /// Credits granted when the month's row does not exist yet.
    pub allocation: Decimal,
    pub endpoint_id: Option<Uuid>,
    pub amount: Decimal,
    pub description: Option<&'a str>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool that only connects on first use.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- User Operations --

    pub async fn insert_user(&self, user: &NewUser) -> anyhow::Result<UserRow> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"INSERT INTO users (user_name, email, department, scope, api_key_hash, api_key_prefix)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(&user.user_name)
        .bind(&user.email)
        .bind(&user.department)
        .bind(user.scope)
        .bind(&user.api_key_hash)
        .bind(&user.api_key_prefix)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Active user owning the given API key digest.
    pub async fn get_user_by_key_hash(&self, key_hash: &str) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE api_key_hash = $1 AND is_active = TRUE"
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_users(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<UserRow>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC, id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_user(&self, id: Uuid, update: &UserUpdate) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"UPDATE users SET
                   user_name = COALESCE($2, user_name),
                   email = COALESCE($3, email),
                   department = COALESCE($4, department),
                   scope = COALESCE($5, scope),
                   is_active = COALESCE($6, is_active),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(id)
        .bind(&update.user_name)
        .bind(&update.email)
        .bind(&update.department)
        .bind(update.scope)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Soft delete. Returns the row as it was before deactivation.
    pub async fn deactivate_user(&self, id: Uuid) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET is_active = FALSE, updated_at = NOW() WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn rotate_api_key(
        &self,
        id: Uuid,
        key_hash: &str,
        key_prefix: &str,
    ) -> anyhow::Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"UPDATE users SET api_key_hash = $2, api_key_prefix = $3, updated_at = NOW()
               WHERE id = $1
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(id)
        .bind(key_hash)
        .bind(key_prefix)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Token Operations --

    /// Insert a token and its `issued` audit row in one transaction.
    pub async fn insert_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<TokenRow> {
        let mut tx = self.pool.begin().await?;
        let row = insert_token_in(&mut tx, user_id, token_hash, expires_at).await?;
        record_token_event_in(&mut tx, row.id, user_id, TokenAction::Issued).await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_token_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Revoke `old` and issue its replacement atomically. Returns `None` when
    /// `old` was revoked concurrently.
    pub async fn rotate_token(
        &self,
        old: &TokenRow,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<TokenRow>> {
        let mut tx = self.pool.begin().await?;
        let revoked = sqlx::query(
            "UPDATE tokens SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(old.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if revoked == 0 {
            return Ok(None);
        }
        record_token_event_in(&mut tx, old.id, old.user_id, TokenAction::Revoked).await?;
        let row = insert_token_in(&mut tx, old.user_id, token_hash, expires_at).await?;
        record_token_event_in(&mut tx, row.id, row.user_id, TokenAction::Refreshed).await?;
        tx.commit().await?;
        Ok(Some(row))
    }

    /// Returns `true` when the token was active and is now revoked.
    pub async fn revoke_token(&self, token: &TokenRow) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE tokens SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(token.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected > 0 {
            record_token_event_in(&mut tx, token.id, token.user_id, TokenAction::Revoked).await?;
        }
        tx.commit().await?;
        Ok(affected > 0)
    }

    /// Delete tokens that expired before `cutoff`; their audit rows cascade.
    pub async fn purge_expired_tokens(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Endpoint Operations --

    pub async fn insert_endpoint(
        &self,
        path: &str,
        description: &str,
        cost: Decimal,
    ) -> anyhow::Result<EndpointRow> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "INSERT INTO endpoints (path, description, cost) VALUES ($1, $2, $3) RETURNING {ENDPOINT_COLUMNS}"
        ))
        .bind(path)
        .bind(description)
        .bind(cost)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_endpoints(&self, active_only: bool) -> anyhow::Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE ($1 = FALSE OR is_active = TRUE) ORDER BY path ASC"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_endpoint(&self, id: Uuid) -> anyhow::Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_active_endpoint_by_path(&self, path: &str) -> anyhow::Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE path = $1 AND is_active = TRUE"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_endpoint(
        &self,
        id: Uuid,
        update: &EndpointUpdate,
    ) -> anyhow::Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            r#"UPDATE endpoints SET
                   path = COALESCE($2, path),
                   description = COALESCE($3, description),
                   cost = COALESCE($4, cost),
                   is_active = COALESCE($5, is_active),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {ENDPOINT_COLUMNS}"#
        ))
        .bind(id)
        .bind(&update.path)
        .bind(&update.description)
        .bind(update.cost)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn deactivate_endpoint(&self, id: Uuid) -> anyhow::Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "UPDATE endpoints SET is_active = FALSE, updated_at = NOW() WHERE id = $1 RETURNING {ENDPOINT_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Balance Operations --

    /// The user's row for `month`, created with `allocation` on first access.
    pub async fn ensure_monthly_balance(
        &self,
        user_id: Uuid,
        month: NaiveDate,
        allocation: Decimal,
    ) -> anyhow::Result<BalanceRow> {
        let mut tx = self.pool.begin().await?;
        let row = ensure_balance_in(&mut tx, user_id, month, allocation).await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_balance(&self, user_id: Uuid, month: NaiveDate) -> anyhow::Result<Option<BalanceRow>> {
        let row = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1 AND balance_month = $2"
        ))
        .bind(user_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_balances(&self, month: NaiveDate) -> anyhow::Result<Vec<BalanceRow>> {
        let rows = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE balance_month = $1 ORDER BY current_balance ASC, user_id ASC"
        ))
        .bind(month)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Take `charge.amount` credits from the month's balance.
    ///
    /// The balance row is locked for the duration of the transaction, so
    /// concurrent reservations serialise and the balance never goes negative.
    pub async fn reserve_credits(&self, charge: &Charge<'_>) -> anyhow::Result<ReserveOutcome> {
        if charge.amount.is_zero() {
            return Ok(ReserveOutcome::Free);
        }

        let mut tx = self.pool.begin().await?;
        ensure_balance_in(&mut tx, charge.user_id, charge.month, charge.allocation).await?;
        let current = lock_balance_in(&mut tx, charge.user_id, charge.month).await?;

        let remaining = match plan_deduction(current, charge.amount) {
            Ok(remaining) => remaining,
            Err(available) => {
                tx.rollback().await?;
                return Ok(ReserveOutcome::Insufficient { available });
            }
        };

        set_balance_in(&mut tx, charge.user_id, charge.month, remaining).await?;
        let row = insert_transaction_in(
            &mut tx,
            charge,
            TransactionKind::Deduction,
            -charge.amount,
            remaining,
        )
        .await?;
        tx.commit().await?;
        Ok(ReserveOutcome::Reserved(row))
    }

    /// Give back credits taken by a reservation whose call failed.
    pub async fn refund_credits(&self, charge: &Charge<'_>) -> anyhow::Result<BalanceTransactionRow> {
        let mut tx = self.pool.begin().await?;
        let current = lock_balance_in(&mut tx, charge.user_id, charge.month).await?;
        let restored = current
            .checked_add(charge.amount)
            .ok_or_else(|| anyhow::anyhow!("refund overflows balance {}", current))?;
        set_balance_in(&mut tx, charge.user_id, charge.month, restored).await?;
        let row = insert_transaction_in(&mut tx, charge, TransactionKind::Refund, charge.amount, restored)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Apply a signed admin delta. Returns `Ok(None)` when the result would
    /// be negative; nothing is written in that case.
    pub async fn adjust_balance(
        &self,
        charge: &Charge<'_>,
    ) -> anyhow::Result<Option<(BalanceRow, BalanceTransactionRow)>> {
        let mut tx = self.pool.begin().await?;
        ensure_balance_in(&mut tx, charge.user_id, charge.month, charge.allocation).await?;
        let current = lock_balance_in(&mut tx, charge.user_id, charge.month).await?;

        let Some(next) = crate::models::balance::apply_adjustment(current, charge.amount) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let balance = set_balance_in(&mut tx, charge.user_id, charge.month, next).await?;
        let row = insert_transaction_in(
            &mut tx,
            charge,
            TransactionKind::AdminAdjustment,
            charge.amount,
            next,
        )
        .await?;
        tx.commit().await?;
        Ok(Some((balance, row)))
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<BalanceTransactionRow>> {
        let rows = sqlx::query_as::<_, BalanceTransactionRow>(&format!(
            r#"SELECT {TX_COLUMNS} FROM balance_transactions
               WHERE user_id = $1
               ORDER BY created_at DESC, id DESC
               LIMIT $2 OFFSET $3"#
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- API Log Operations --

    pub async fn insert_api_log(&self, entry: &ApiLogEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO api_logs
                   (id, created_at, user_id, token_id, endpoint_id, method, path, status,
                    latency_ms, user_agent, client_ip, prompt_tokens, completion_tokens, error_code)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(entry.user_id)
        .bind(entry.token_id)
        .bind(entry.endpoint_id)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(entry.status as i16)
        .bind(entry.latency_ms.min(i32::MAX as u64) as i32)
        .bind(&entry.user_agent)
        .bind(&entry.client_ip)
        .bind(entry.prompt_tokens.map(|t| t as i32))
        .bind(entry.completion_tokens.map(|t| t as i32))
        .bind(&entry.error_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_api_logs(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ApiLogRow>> {
        let rows = sqlx::query_as::<_, ApiLogRow>(
            r#"SELECT id, created_at, user_id, token_id, endpoint_id, method, path, status,
                      latency_ms, user_agent, client_ip, prompt_tokens, completion_tokens, error_code
               FROM api_logs
               WHERE ($1::uuid IS NULL OR user_id = $1)
               ORDER BY created_at DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Successful metered calls and net credits spent per endpoint for one
    /// user. `[from, to)` bounds the log window in UTC.
    pub async fn usage_summary(
        &self,
        user_id: Uuid,
        month: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EndpointUsage>> {
        let rows = sqlx::query_as::<_, EndpointUsage>(
            r#"WITH calls AS (
                   SELECT endpoint_id, COUNT(*) AS calls
                   FROM api_logs
                   WHERE user_id = $1 AND endpoint_id IS NOT NULL AND status < 400
                     AND created_at >= $3 AND created_at < $4
                   GROUP BY endpoint_id
               ),
               spend AS (
                   SELECT endpoint_id, -SUM(amount) AS credits
                   FROM balance_transactions
                   WHERE user_id = $1 AND balance_month = $2 AND endpoint_id IS NOT NULL
                     AND kind IN ('deduction', 'refund')
                   GROUP BY endpoint_id
               )
               SELECT COALESCE(c.endpoint_id, s.endpoint_id) AS endpoint_id,
                      e.path AS path,
                      COALESCE(c.calls, 0)::BIGINT AS calls,
                      COALESCE(s.credits, 0)::NUMERIC AS credits_spent
               FROM calls c
               FULL OUTER JOIN spend s ON c.endpoint_id = s.endpoint_id
               LEFT JOIN endpoints e ON e.id = COALESCE(c.endpoint_id, s.endpoint_id)
               ORDER BY credits_spent DESC, calls DESC"#,
        )
        .bind(user_id)
        .bind(month)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn purge_api_logs(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM api_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_token_in(
    conn: &mut PgConnection,
    user_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<TokenRow> {
    let row = sqlx::query_as::<_, TokenRow>(&format!(
        "INSERT INTO tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3) RETURNING {TOKEN_COLUMNS}"
    ))
    .bind(user_id)
    .bind(token_hash)
    .bind(expires_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

async fn record_token_event_in(
    conn: &mut PgConnection,
    token_id: Uuid,
    user_id: Uuid,
    action: TokenAction,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO token_transactions (token_id, user_id, action) VALUES ($1, $2, $3)")
        .bind(token_id)
        .bind(user_id)
        .bind(action.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn ensure_balance_in(
    conn: &mut PgConnection,
    user_id: Uuid,
    month: NaiveDate,
    allocation: Decimal,
) -> anyhow::Result<BalanceRow> {
    let inserted = sqlx::query_as::<_, BalanceRow>(&format!(
        r#"INSERT INTO user_balances (user_id, balance_month, allocated, current_balance)
           VALUES ($1, $2, $3, $3)
           ON CONFLICT (user_id, balance_month) DO NOTHING
           RETURNING {BALANCE_COLUMNS}"#
    ))
    .bind(user_id)
    .bind(month)
    .bind(allocation)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = inserted {
        let grant = Charge {
            user_id,
            month,
            allocation,
            endpoint_id: None,
            amount: allocation,
            description: Some("monthly allocation"),
        };
        insert_transaction_in(conn, &grant, TransactionKind::Allocation, allocation, allocation).await?;
        tracing::info!(%user_id, %month, %allocation, "allocated monthly credits");
        return Ok(row);
    }

    let row = sqlx::query_as::<_, BalanceRow>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1 AND balance_month = $2"
    ))
    .bind(user_id)
    .bind(month)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

async fn lock_balance_in(conn: &mut PgConnection, user_id: Uuid, month: NaiveDate) -> anyhow::Result<Decimal> {
    let current = sqlx::query_scalar::<_, Decimal>(
        "SELECT current_balance FROM user_balances WHERE user_id = $1 AND balance_month = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(month)
    .fetch_one(&mut *conn)
    .await?;
    Ok(current)
}

async fn set_balance_in(
    conn: &mut PgConnection,
    user_id: Uuid,
    month: NaiveDate,
    value: Decimal,
) -> anyhow::Result<BalanceRow> {
    let row = sqlx::query_as::<_, BalanceRow>(&format!(
        r#"UPDATE user_balances SET current_balance = $3, updated_at = NOW()
           WHERE user_id = $1 AND balance_month = $2
           RETURNING {BALANCE_COLUMNS}"#
    ))
    .bind(user_id)
    .bind(month)
    .bind(value)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

async fn insert_transaction_in(
    conn: &mut PgConnection,
    charge: &Charge<'_>,
    kind: TransactionKind,
    amount: Decimal,
    balance_after: Decimal,
) -> anyhow::Result<BalanceTransactionRow> {
    // rows written in one transaction must sort in write order
    let row = sqlx::query_as::<_, BalanceTransactionRow>(&format!(
        r#"INSERT INTO balance_transactions
               (user_id, endpoint_id, balance_month, kind, amount, balance_after, description, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp())
           RETURNING {TX_COLUMNS}"#
    ))
    .bind(charge.user_id)
    .bind(charge.endpoint_id)
    .bind(charge.month)
    .bind(kind)
    .bind(amount)
    .bind(balance_after)
    .bind(charge.description)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}
