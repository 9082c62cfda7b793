//! Persistence backends for quota windows, usage logs and session transcripts.
//!
//! Every backend implements the same narrow traits so the ledger, the
//! accounting workers and the session engine never see a concrete store.
//! [`memory`] is the reference backend used by tests and single-instance
//! deployments; `postgres` is available behind the `postgres` feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryMessageStore, MemoryQuotaStore, MemoryUsageLog};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionOutcome;
use crate::tiers::{QuotaSlot, Tier};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached or timed out.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Optimistic write lost against a concurrent writer too many times.
    #[error("Write conflict on {key}")]
    Conflict { key: String },

    #[error("Store backend error: {message}")]
    Backend { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted usage for one `(user, slot)` window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRow {
    pub user_id: String,
    pub slot: QuotaSlot,
    pub tokens_used: u64,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
    /// Bumped on every write; writers compare-and-swap on it.
    pub version: u64,
}

impl UsageRow {
    pub fn fresh(user_id: impl Into<String>, slot: QuotaSlot, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            slot,
            tokens_used: 0,
            window_start: slot.kind.window_start(now),
            reset_at: slot.kind.next_reset(now),
            version: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Zeroed copy positioned on the window containing `now`.
    pub fn rolled_over(&self, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version + 1,
            ..Self::fresh(self.user_id.clone(), self.slot, now)
        }
    }

    pub fn with_added(&self, tokens: u64) -> Self {
        Self {
            tokens_used: self.tokens_used.saturating_add(tokens),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Stored version did not match the expected one.
    Conflict,
    /// The deduction key was already recorded for this slot.
    AlreadyApplied,
}

#[async_trait::async_trait]
pub trait QuotaStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, user_id: &str, slot: QuotaSlot) -> StoreResult<Option<UsageRow>>;

    /// Writes `row` if the stored version equals `expected`.
    ///
    /// `expected = None` inserts only when no row exists. When `deduction` is
    /// set the key is recorded in the same atomic step, and a key already
    /// recorded for `row.slot` yields [`WriteOutcome::AlreadyApplied`].
    async fn write(
        &self,
        expected: Option<u64>,
        row: &UsageRow,
        deduction: Option<Uuid>,
    ) -> StoreResult<WriteOutcome>;
}

/// One line of the append-only usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub tier: Tier,
    pub endpoint: String,
    pub canonical_model: String,
    pub provider: String,
    pub raw_tokens: u64,
    pub multiplier: Decimal,
    pub plan_tokens: u64,
    pub outcome: SessionOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait UsageLogStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, record: &UsageLogRecord) -> StoreResult<()>;
}

/// Assistant turn persisted once a session produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: Uuid,
    pub user_id: String,
    pub chat_id: Option<String>,
    pub role: String,
    pub content: String,
    pub raw_tokens: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    fn name(&self) -> &str;

    async fn save(&self, message: &StoredMessage) -> StoreResult<()>;
}
