//! Quota windows and their UTC reset boundaries.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    /// Resets on the 1st of the month, 00:00 UTC.
    Monthly,
    /// Resets every Monday, 00:00 UTC.
    Weekly,
    /// Resets every day, 00:00 UTC.
    Daily,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Weekly => "weekly",
            Self::Daily => "daily",
        }
    }

    /// Start of the window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let start = match self {
            Self::Daily => today,
            Self::Weekly => {
                today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
            }
            Self::Monthly => first_of_month(today.year(), today.month()),
        };
        midnight(start)
    }

    /// First boundary strictly after `now`.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.window_start(now).date_naive();
        let next = match self {
            Self::Daily => start + Duration::days(1),
            Self::Weekly => start + Duration::days(7),
            Self::Monthly => {
                if start.month() == 12 {
                    first_of_month(start.year() + 1, 1)
                } else {
                    first_of_month(start.year(), start.month() + 1)
                }
            }
        };
        midnight(next)
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Which allowance a deduction is charged against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPool {
    #[default]
    Primary,
    Fallback,
}

/// Storage key for one usage window of one user.
///
/// A primary daily window and a fallback daily window share a `PeriodKind`
/// but are tracked independently, so the pool is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaSlot {
    pub kind: PeriodKind,
    pub fallback: bool,
}

impl QuotaSlot {
    pub const fn primary(kind: PeriodKind) -> Self {
        Self {
            kind,
            fallback: false,
        }
    }

    pub const fn fallback(kind: PeriodKind) -> Self {
        Self {
            kind,
            fallback: true,
        }
    }

    pub fn pool(&self) -> QuotaPool {
        if self.fallback {
            QuotaPool::Fallback
        } else {
            QuotaPool::Primary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match (self.fallback, self.kind) {
            (false, PeriodKind::Monthly) => "monthly",
            (false, PeriodKind::Weekly) => "weekly",
            (false, PeriodKind::Daily) => "daily",
            (true, PeriodKind::Monthly) => "fallback_monthly",
            (true, PeriodKind::Weekly) => "fallback_weekly",
            (true, PeriodKind::Daily) => "fallback_daily",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (fallback, kind) = match value.strip_prefix("fallback_") {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let kind = match kind {
            "monthly" => PeriodKind::Monthly,
            "weekly" => PeriodKind::Weekly,
            "daily" => PeriodKind::Daily,
            _ => return None,
        };
        Some(Self { kind, fallback })
    }
}

impl fmt::Display for QuotaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for QuotaSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for QuotaSlot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown quota slot: {raw}")))
    }
}
