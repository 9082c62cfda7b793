//! Subscription tiers and their quota allowances.

mod period;

pub use period::{PeriodKind, QuotaPool, QuotaSlot};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Model served once a tier's primary allowance is spent.
pub const DEFAULT_FALLBACK_MODEL: &str = "llama-3.3-70b";

/// Opaque tier name, e.g. `free`, `plus`, `pro`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(String);

impl Tier {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_string())
    }

    pub fn free() -> Self {
        Self::new("free")
    }

    pub fn plus() -> Self {
        Self::new("plus")
    }

    pub fn pro() -> Self {
        Self::new("pro")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One enforced window: at most `limit` plan tokens per `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPeriod {
    pub kind: PeriodKind,
    pub limit: u64,
}

impl QuotaPeriod {
    pub const fn new(kind: PeriodKind, limit: u64) -> Self {
        Self { kind, limit }
    }
}

/// Secondary allowance that routes to a cheaper model once primary windows are spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackQuota {
    pub kind: PeriodKind,
    pub limit: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: Tier,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub quota_periods: Vec<QuotaPeriod>,
    #[serde(default)]
    pub fallback: Option<FallbackQuota>,
    /// Model tags this tier may use in addition to models that list the tier
    /// explicitly. `*` grants every model.
    #[serde(default)]
    pub allowed_model_tags: BTreeSet<String>,
}

impl TierConfig {
    pub fn new(name: impl Into<Tier>) -> Self {
        let name = name.into();
        Self {
            display_name: name.to_string(),
            name,
            quota_periods: Vec::new(),
            fallback: None,
            allowed_model_tags: BTreeSet::new(),
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn period(mut self, kind: PeriodKind, limit: u64) -> Self {
        self.quota_periods.retain(|p| p.kind != kind);
        self.quota_periods.push(QuotaPeriod::new(kind, limit));
        self
    }

    pub fn fallback(mut self, kind: PeriodKind, limit: u64, model: impl Into<String>) -> Self {
        self.fallback = Some(FallbackQuota {
            kind,
            limit,
            model: model.into(),
        });
        self
    }

    pub fn allow_tag(mut self, tag: impl Into<String>) -> Self {
        self.allowed_model_tags.insert(tag.into());
        self
    }

    pub fn limit_for(&self, kind: PeriodKind) -> Option<u64> {
        self.quota_periods
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.limit)
    }

    /// Every slot a primary deduction touches.
    pub fn primary_slots(&self) -> impl Iterator<Item = (QuotaSlot, u64)> + '_ {
        self.quota_periods
            .iter()
            .map(|p| (QuotaSlot::primary(p.kind), p.limit))
    }

    pub fn fallback_slot(&self) -> Option<(QuotaSlot, u64)> {
        self.fallback
            .as_ref()
            .map(|f| (QuotaSlot::fallback(f.kind), f.limit))
    }

    pub fn grants_tag(&self, tag: &str) -> bool {
        self.allowed_model_tags.contains("*") || self.allowed_model_tags.contains(tag)
    }

    /// Multiplies every daily allowance by `scale`, rounding down.
    pub fn scale_daily(&mut self, scale: f64) {
        for period in &mut self.quota_periods {
            if period.kind == PeriodKind::Daily {
                period.limit = (period.limit as f64 * scale) as u64;
            }
        }
        if let Some(fallback) = &mut self.fallback
            && fallback.kind == PeriodKind::Daily
        {
            fallback.limit = (fallback.limit as f64 * scale) as u64;
        }
    }
}

/// Free: 20k plan tokens per month, no fallback.
pub fn free() -> TierConfig {
    TierConfig::new("free")
        .display_name("Free")
        .period(PeriodKind::Monthly, 20_000)
        .allow_tag("free")
}

/// Plus: 40k plan tokens per day plus a 40k daily fallback allowance.
pub fn plus() -> TierConfig {
    TierConfig::new("plus")
        .display_name("Plus")
        .period(PeriodKind::Daily, 40_000)
        .fallback(PeriodKind::Daily, 40_000, DEFAULT_FALLBACK_MODEL)
        .allow_tag("free")
        .allow_tag("plus")
}

/// Pro: 500k plan tokens per day plus a 500k daily fallback allowance.
pub fn pro() -> TierConfig {
    TierConfig::new("pro")
        .display_name("Pro")
        .period(PeriodKind::Daily, 500_000)
        .fallback(PeriodKind::Daily, 500_000, DEFAULT_FALLBACK_MODEL)
        .allow_tag("*")
}

pub fn builtin_tiers() -> Vec<TierConfig> {
    vec![free(), plus(), pro()]
}
