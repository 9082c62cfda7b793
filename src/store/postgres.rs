//! PostgreSQL backend for quota windows, the usage log and transcripts.
//!
//! Enable with the `postgres` feature flag.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    MessageStore, QuotaStore, StoreError, StoreResult, StoredMessage, UsageLogRecord,
    UsageLogStore, UsageRow, WriteOutcome,
};
use crate::tiers::QuotaSlot;

/// One pool shared by all three store traits.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS quota_period_usage (
                user_id VARCHAR(255) NOT NULL,
                slot VARCHAR(32) NOT NULL,
                tokens_used BIGINT NOT NULL DEFAULT 0,
                window_start TIMESTAMPTZ NOT NULL,
                reset_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_id, slot)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_deductions (
                deduction_id UUID NOT NULL,
                slot VARCHAR(32) NOT NULL,
                user_id VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (deduction_id, slot)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS usage_log (
                session_id UUID PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                tier VARCHAR(64) NOT NULL,
                endpoint VARCHAR(255) NOT NULL,
                canonical_model VARCHAR(255) NOT NULL,
                provider VARCHAR(255) NOT NULL,
                raw_tokens BIGINT NOT NULL,
                multiplier TEXT NOT NULL,
                plan_tokens BIGINT NOT NULL,
                outcome VARCHAR(32) NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_usage_log_user ON usage_log (user_id, recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id BIGSERIAL PRIMARY KEY,
                session_id UUID NOT NULL,
                user_id VARCHAR(255) NOT NULL,
                chat_id VARCHAR(255),
                role VARCHAR(32) NOT NULL,
                content TEXT NOT NULL,
                raw_tokens BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::unavailable(err.to_string())
        }
        other => StoreError::backend(other.to_string()),
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl QuotaStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn load(&self, user_id: &str, slot: QuotaSlot) -> StoreResult<Option<UsageRow>> {
        let row = sqlx::query(
            "SELECT tokens_used, window_start, reset_at, version
             FROM quota_period_usage WHERE user_id = $1 AND slot = $2",
        )
        .bind(user_id)
        .bind(slot.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_err)?;

        Ok(row.map(|row| UsageRow {
            user_id: user_id.to_string(),
            slot,
            tokens_used: from_db(row.get("tokens_used")),
            window_start: row.get::<DateTime<Utc>, _>("window_start"),
            reset_at: row.get::<DateTime<Utc>, _>("reset_at"),
            version: from_db(row.get("version")),
        }))
    }

    async fn write(
        &self,
        expected: Option<u64>,
        row: &UsageRow,
        deduction: Option<Uuid>,
    ) -> StoreResult<WriteOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        if let Some(id) = deduction {
            let inserted = sqlx::query(
                "INSERT INTO quota_deductions (deduction_id, slot, user_id)
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(row.slot.as_str())
            .bind(&row.user_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
            if inserted.rows_affected() == 0 {
                tx.rollback().await.map_err(map_err)?;
                return Ok(WriteOutcome::AlreadyApplied);
            }
        }

        let affected = match expected {
            None => sqlx::query(
                "INSERT INTO quota_period_usage
                     (user_id, slot, tokens_used, window_start, reset_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (user_id, slot) DO NOTHING",
            )
            .bind(&row.user_id)
            .bind(row.slot.as_str())
            .bind(to_db(row.tokens_used))
            .bind(row.window_start)
            .bind(row.reset_at)
            .bind(to_db(row.version))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?,
            Some(version) => sqlx::query(
                "UPDATE quota_period_usage
                 SET tokens_used = $3, window_start = $4, reset_at = $5,
                     version = $6, updated_at = NOW()
                 WHERE user_id = $1 AND slot = $2 AND version = $7",
            )
            .bind(&row.user_id)
            .bind(row.slot.as_str())
            .bind(to_db(row.tokens_used))
            .bind(row.window_start)
            .bind(row.reset_at)
            .bind(to_db(row.version))
            .bind(to_db(version))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?,
        };

        if affected.rows_affected() == 0 {
            tx.rollback().await.map_err(map_err)?;
            return Ok(WriteOutcome::Conflict);
        }

        tx.commit().await.map_err(map_err)?;
        Ok(WriteOutcome::Applied)
    }
}

#[async_trait]
impl UsageLogStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn append(&self, record: &UsageLogRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO usage_log
                 (session_id, user_id, tier, endpoint, canonical_model, provider,
                  raw_tokens, multiplier, plan_tokens, outcome, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (session_id) DO NOTHING",
        )
        .bind(record.session_id)
        .bind(&record.user_id)
        .bind(record.tier.as_str())
        .bind(&record.endpoint)
        .bind(&record.canonical_model)
        .bind(&record.provider)
        .bind(to_db(record.raw_tokens))
        .bind(record.multiplier.to_string())
        .bind(to_db(record.plan_tokens))
        .bind(record.outcome.as_str())
        .bind(record.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn save(&self, message: &StoredMessage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_messages
                 (session_id, user_id, chat_id, role, content, raw_tokens, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(message.session_id)
        .bind(&message.user_id)
        .bind(&message.chat_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(to_db(message.raw_tokens))
        .bind(message.created_at)
        .execute(&*self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}
