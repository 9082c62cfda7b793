//! Per-user, per-period quota enforcement.
//!
//! The ledger never holds a lock across a store round trip. Every write is a
//! version-checked compare-and-swap on a single `(user, slot)` row, so
//! concurrent sessions of one user add up correctly while the pre-flight
//! check may transiently overshoot by one in-flight request.

mod plan;

pub use plan::{InvalidMultiplier, Multiplier, plan_tokens};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::resilience::ExponentialBackoff;
use crate::store::{QuotaStore, StoreError, StoreResult, UsageRow, WriteOutcome};
use crate::tiers::{QuotaPool, QuotaSlot, TierConfig};
use crate::{Error, Result};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Result of a pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Primary allowance is spent; serve the request from the fallback pool
    /// using `model` instead of the requested one.
    Fallback { model: String },
    Denied(QuotaDenial),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenial {
    pub slot: QuotaSlot,
    pub limit: u64,
    pub used: u64,
    pub resets_at: DateTime<Utc>,
}

/// Usage to charge for one finished session.
#[derive(Debug, Clone)]
pub struct Deduction {
    /// Idempotency key, normally the session id.
    pub key: Uuid,
    pub user_id: String,
    pub pool: QuotaPool,
    pub plan_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Applied { slots: usize },
    /// Every slot had already recorded this key.
    Duplicate,
}

/// A deduction that stopped at a failing slot after charging `applied` others.
///
/// Retrying the same [`Deduction`] is safe: charged slots report the key as
/// already recorded.
#[derive(Debug, thiserror::Error)]
#[error("deduction stopped after {applied} of {total} slots: {source}")]
pub struct DeductError {
    pub applied: usize,
    pub total: usize,
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodUsage {
    pub period: QuotaSlot,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Compare-and-swap attempts per slot before giving up with a conflict.
    pub max_write_attempts: u32,
    pub conflict_backoff: ExponentialBackoff,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 8,
            conflict_backoff: ExponentialBackoff::contention(),
        }
    }
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    config: LedgerConfig,
    clock: Clock,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            config: LedgerConfig::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the wall clock, for window-boundary tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Pre-flight check against every configured window of `tier`.
    ///
    /// Fails closed: a store error becomes [`Error::ServiceUnavailable`].
    pub async fn check_and_reserve(
        &self,
        user_id: &str,
        tier: &TierConfig,
        estimated_tokens: u64,
    ) -> Result<Admission> {
        let now = self.now();

        let mut exhausted = None;
        for (slot, limit) in tier.primary_slots() {
            let row = self.current(user_id, slot, now).await.map_err(fail_closed)?;
            if row.tokens_used.saturating_add(estimated_tokens) > limit {
                exhausted = Some(denial(&row, limit));
                break;
            }
        }

        let Some(primary) = exhausted else {
            return Ok(Admission::Allowed);
        };

        let (Some(fallback), Some((slot, limit))) = (&tier.fallback, tier.fallback_slot()) else {
            tracing::debug!(
                user_id,
                tier = %tier.name,
                period = %primary.slot,
                used = primary.used,
                limit = primary.limit,
                "Quota exhausted without fallback"
            );
            return Ok(Admission::Denied(primary));
        };

        let row = self.current(user_id, slot, now).await.map_err(fail_closed)?;
        if row.tokens_used.saturating_add(estimated_tokens) > limit {
            tracing::debug!(
                user_id,
                tier = %tier.name,
                used = row.tokens_used,
                limit,
                "Fallback quota exhausted"
            );
            return Ok(Admission::Denied(denial(&row, limit)));
        }

        tracing::debug!(
            user_id,
            tier = %tier.name,
            exhausted = %primary.slot,
            model = %fallback.model,
            "Routing to fallback quota"
        );
        Ok(Admission::Fallback {
            model: fallback.model.clone(),
        })
    }

    /// Adds `plan_tokens` to every slot of the deduction's pool.
    ///
    /// Each slot is written at most once per key; a replay of an applied
    /// deduction reports [`DeductOutcome::Duplicate`].
    pub async fn deduct(
        &self,
        tier: &TierConfig,
        deduction: &Deduction,
    ) -> std::result::Result<DeductOutcome, DeductError> {
        if deduction.plan_tokens == 0 {
            return Ok(DeductOutcome::Applied { slots: 0 });
        }

        let slots: Vec<QuotaSlot> = match deduction.pool {
            QuotaPool::Fallback => match tier.fallback_slot() {
                Some((slot, _)) => vec![slot],
                None => {
                    tracing::warn!(
                        user_id = %deduction.user_id,
                        tier = %tier.name,
                        "Fallback deduction for tier without fallback; charging primary windows"
                    );
                    tier.primary_slots().map(|(slot, _)| slot).collect()
                }
            },
            QuotaPool::Primary => tier.primary_slots().map(|(slot, _)| slot).collect(),
        };

        let mut applied = 0;
        let mut duplicates = 0;
        for slot in &slots {
            match self.apply(deduction, *slot).await {
                Ok(true) => applied += 1,
                Ok(false) => duplicates += 1,
                Err(source) => {
                    return Err(DeductError {
                        applied,
                        total: slots.len(),
                        source,
                    });
                }
            }
        }

        if applied == 0 && duplicates > 0 {
            Ok(DeductOutcome::Duplicate)
        } else {
            Ok(DeductOutcome::Applied { slots: applied })
        }
    }

    /// Usage per configured window, with expired windows reported as reset.
    pub async fn usage(&self, user_id: &str, tier: &TierConfig) -> Result<Vec<PeriodUsage>> {
        let now = self.now();
        let mut report = Vec::new();
        for (slot, limit) in tier.primary_slots().chain(tier.fallback_slot()) {
            let row = match self.store.load(user_id, slot).await.map_err(fail_closed)? {
                Some(row) if !row.is_expired(now) => row,
                _ => UsageRow::fresh(user_id, slot, now),
            };
            report.push(PeriodUsage {
                period: slot,
                limit,
                used: row.tokens_used,
                remaining: limit.saturating_sub(row.tokens_used),
                resets_at: row.reset_at,
            });
        }
        Ok(report)
    }

    /// Returns `false` when the key was already recorded for `slot`.
    async fn apply(&self, deduction: &Deduction, slot: QuotaSlot) -> StoreResult<bool> {
        for attempt in 1..=self.config.max_write_attempts {
            let row = self.current(&deduction.user_id, slot, self.now()).await?;
            let next = row.with_added(deduction.plan_tokens);
            match self
                .store
                .write(Some(row.version), &next, Some(deduction.key))
                .await?
            {
                WriteOutcome::Conflict => {
                    tokio::time::sleep(self.config.conflict_backoff.delay_for(attempt)).await;
                }
                WriteOutcome::AlreadyApplied => return Ok(false),
                WriteOutcome::Applied => {
                    tracing::debug!(
                        user_id = %deduction.user_id,
                        period = %slot,
                        plan_tokens = deduction.plan_tokens,
                        tokens_used = next.tokens_used,
                        "Deduction applied"
                    );
                    return Ok(true);
                }
            }
        }
        Err(StoreError::Conflict {
            key: format!("{}/{}", deduction.user_id, slot),
        })
    }

    /// Loads the live row for `slot`, creating it or rolling it over first.
    async fn current(
        &self,
        user_id: &str,
        slot: QuotaSlot,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageRow> {
        for attempt in 1..=self.config.max_write_attempts {
            let (expected, row) = match self.store.load(user_id, slot).await? {
                Some(row) if !row.is_expired(now) => return Ok(row),
                Some(row) => {
                    tracing::debug!(
                        user_id,
                        period = %slot,
                        tokens_used = row.tokens_used,
                        reset_at = %row.reset_at,
                        "Resetting expired quota window"
                    );
                    (Some(row.version), row.rolled_over(now))
                }
                None => (None, UsageRow::fresh(user_id, slot, now)),
            };

            match self.store.write(expected, &row, None).await? {
                WriteOutcome::Conflict => {
                    tokio::time::sleep(self.config.conflict_backoff.delay_for(attempt)).await;
                }
                _ => return Ok(row),
            }
        }
        Err(StoreError::Conflict {
            key: format!("{user_id}/{slot}"),
        })
    }
}

fn denial(row: &UsageRow, limit: u64) -> QuotaDenial {
    QuotaDenial {
        slot: row.slot,
        limit,
        used: row.tokens_used,
        resets_at: row.reset_at,
    }
}

fn fail_closed(err: StoreError) -> Error {
    tracing::error!(error = %err, "Quota store unavailable; rejecting request");
    Error::ServiceUnavailable(err.to_string())
}
