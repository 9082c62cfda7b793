//! Asynchronous usage accounting.
//!
//! Sessions hand one [`AccountingTask`] to an [`AccountingSink`] when they
//! finish. The [`AccountingPipeline`] sink applies the deduction and appends
//! the usage-log record on a worker pool, off the request path.

mod pipeline;

pub use pipeline::{AccountingPipeline, PipelineConfig, ShutdownReport};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::quota::Multiplier;
use crate::session::SessionOutcome;
use crate::tiers::{QuotaPool, Tier};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountingTask {
    /// Doubles as the deduction idempotency key.
    pub session_id: Uuid,
    pub user_id: String,
    pub tier: Tier,
    pub endpoint: String,
    pub canonical_model: String,
    pub provider: String,
    pub multiplier: Multiplier,
    pub raw_tokens: u64,
    pub outcome: SessionOutcome,
    pub pool: QuotaPool,
    pub finished_at: DateTime<Utc>,
}

impl AccountingTask {
    pub fn plan_tokens(&self) -> u64 {
        self.multiplier.plan_tokens(self.raw_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Queue full; the task was discarded.
    Dropped,
    /// The pipeline is shutting down.
    Closed,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// Non-blocking hand-off used by the session engine.
pub trait AccountingSink: Send + Sync {
    fn submit(&self, task: AccountingTask) -> EnqueueOutcome;
}
