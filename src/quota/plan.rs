//! Raw-to-plan token conversion.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Multiplier must be positive, got {0}")]
pub struct InvalidMultiplier(pub Decimal);

/// Per-model cost factor. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Multiplier(Decimal);

impl Multiplier {
    pub const ONE: Self = Self(Decimal::ONE);

    pub fn new(value: Decimal) -> Result<Self, InvalidMultiplier> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(InvalidMultiplier(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn plan_tokens(&self, raw_tokens: u64) -> u64 {
        plan_tokens(raw_tokens, self.0)
    }
}

impl TryFrom<Decimal> for Multiplier {
    type Error = InvalidMultiplier;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Multiplier> for Decimal {
    fn from(value: Multiplier) -> Self {
        value.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0.normalize())
    }
}

/// `round_half_up(raw_tokens × multiplier)`, saturating at `u64::MAX`.
pub fn plan_tokens(raw_tokens: u64, multiplier: Decimal) -> u64 {
    let Some(product) = Decimal::from(raw_tokens).checked_mul(multiplier) else {
        return u64::MAX;
    };
    product
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .unwrap_or(if product.is_sign_negative() { 0 } else { u64::MAX })
}
