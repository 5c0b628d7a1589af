//! Repository for `organization_quotas` and `credit_transactions`.
//!
//! Consumption and refunds run inside a single transaction each: the quota
//! row lock taken by the conditional `UPDATE` serializes concurrent consumers
//! for the same organization.

use sqlx::{PgConnection, PgPool};
use verdant_core::credits::{next_refresh_date, CreditTransaction};
use verdant_core::types::Timestamp;

use crate::models::{to_db_int, QuotaRow, TransactionRow};

const QUOTA_COLUMNS: &str = "organization_id, total, used, refresh_date";

const TRANSACTION_COLUMNS: &str =
    "id, organization_id, user_id, render_id, amount, kind, description, created_at";

/// Result of the conditional increment inside [`LedgerRepo::consume`].
pub enum ConsumeRow {
    Consumed(QuotaRow),
    /// Carries the current row, or `None` for an unprovisioned organization.
    Insufficient(Option<QuotaRow>),
}

pub struct LedgerRepo;

impl LedgerRepo {
    /// Reset `used` and advance the refresh date if it has passed.
    async fn refresh_if_due(
        conn: &mut PgConnection,
        organization_id: &str,
        now: Timestamp,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE organization_quotas \
             SET used = 0, refresh_date = $3, updated_at = NOW() \
             WHERE organization_id = $1 AND refresh_date <= $2",
        )
        .bind(organization_id)
        .bind(now)
        .bind(next_refresh_date(now))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn find_quota(
        conn: &mut PgConnection,
        organization_id: &str,
    ) -> Result<Option<QuotaRow>, sqlx::Error> {
        let query =
            format!("SELECT {QUOTA_COLUMNS} FROM organization_quotas WHERE organization_id = $1");
        sqlx::query_as::<_, QuotaRow>(&query)
            .bind(organization_id)
            .fetch_optional(&mut *conn)
            .await
    }

    /// Current quota after applying a due refresh.
    pub async fn get_quota(
        pool: &PgPool,
        organization_id: &str,
        now: Timestamp,
    ) -> Result<Option<QuotaRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        Self::refresh_if_due(&mut tx, organization_id, now).await?;
        let row = Self::find_quota(&mut tx, organization_id).await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Create or resize an organization's quota. New rows refresh next month.
    pub async fn upsert_total(
        pool: &PgPool,
        organization_id: &str,
        total: u32,
        now: Timestamp,
    ) -> Result<QuotaRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO organization_quotas (organization_id, total, used, refresh_date) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (organization_id) \
             DO UPDATE SET total = EXCLUDED.total, updated_at = NOW() \
             RETURNING {QUOTA_COLUMNS}"
        );
        sqlx::query_as::<_, QuotaRow>(&query)
            .bind(organization_id)
            .bind(to_db_int(total))
            .bind(next_refresh_date(now))
            .fetch_one(pool)
            .await
    }

    /// Refresh, check-and-increment, and record the consume transaction.
    pub async fn consume(
        pool: &PgPool,
        tx_record: &CreditTransaction,
        now: Timestamp,
    ) -> Result<ConsumeRow, sqlx::Error> {
        let mut tx = pool.begin().await?;
        Self::refresh_if_due(&mut tx, &tx_record.organization_id, now).await?;

        let query = format!(
            "UPDATE organization_quotas \
             SET used = used + $2, updated_at = NOW() \
             WHERE organization_id = $1 AND total - used >= $2 \
             RETURNING {QUOTA_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, QuotaRow>(&query)
            .bind(&tx_record.organization_id)
            .bind(to_db_int(tx_record.amount))
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = updated else {
            let current = Self::find_quota(&mut tx, &tx_record.organization_id).await?;
            tx.commit().await?;
            return Ok(ConsumeRow::Insufficient(current));
        };

        Self::insert_transaction(&mut tx, tx_record).await?;
        tx.commit().await?;
        Ok(ConsumeRow::Consumed(row))
    }

    /// Record a refund and give the credits back, once per render.
    ///
    /// Returns `false` if the render was already refunded.
    pub async fn refund_once(
        pool: &PgPool,
        tx_record: &CreditTransaction,
        now: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;
        Self::refresh_if_due(&mut tx, &tx_record.organization_id, now).await?;

        let inserted = sqlx::query(
            "INSERT INTO credit_transactions \
                 (id, organization_id, user_id, render_id, amount, kind, description, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (render_id, kind) DO NOTHING",
        )
        .bind(&tx_record.id)
        .bind(&tx_record.organization_id)
        .bind(&tx_record.user_id)
        .bind(&tx_record.render_id)
        .bind(to_db_int(tx_record.amount))
        .bind(tx_record.kind.as_str())
        .bind(&tx_record.description)
        .bind(tx_record.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE organization_quotas \
             SET used = GREATEST(used - $2, 0), updated_at = NOW() \
             WHERE organization_id = $1",
        )
        .bind(&tx_record.organization_id)
        .bind(to_db_int(tx_record.amount))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_transaction(
        conn: &mut PgConnection,
        tx_record: &CreditTransaction,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO credit_transactions \
                 (id, organization_id, user_id, render_id, amount, kind, description, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&tx_record.id)
        .bind(&tx_record.organization_id)
        .bind(&tx_record.user_id)
        .bind(&tx_record.render_id)
        .bind(to_db_int(tx_record.amount))
        .bind(tx_record.kind.as_str())
        .bind(&tx_record.description)
        .bind(tx_record.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn list_transactions(
        pool: &PgPool,
        organization_id: &str,
        limit: i64,
    ) -> Result<Vec<TransactionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE organization_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(organization_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
