use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::ProviderEntry;
use crate::quota::Multiplier;
use crate::tiers::Tier;

/// Request shape the upstream endpoint expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Chat completions.
    #[default]
    Standard,
    /// Responses API.
    Responses,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub canonical_name: String,
    /// Client-facing names; always contains `canonical_name`.
    pub aliases: BTreeSet<String>,
    pub provider: String,
    /// Name sent upstream when it differs from the canonical name.
    pub upstream_model: Option<String>,
    pub multiplier: Multiplier,
    pub tier_access: BTreeSet<Tier>,
    pub tags: BTreeSet<String>,
    pub available: bool,
    pub mode: ApiMode,
}

impl ModelEntry {
    pub fn new(canonical_name: impl Into<String>, provider: impl Into<String>) -> Self {
        let canonical_name = canonical_name.into();
        Self {
            aliases: BTreeSet::from([canonical_name.clone()]),
            canonical_name,
            provider: provider.into(),
            upstream_model: None,
            multiplier: Multiplier::ONE,
            tier_access: BTreeSet::new(),
            tags: BTreeSet::new(),
            available: true,
            mode: ApiMode::Standard,
        }
    }

    pub fn upstream_name(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.canonical_name)
    }

    pub fn allows(&self, tier: &Tier) -> bool {
        self.tier_access.contains(tier)
    }
}

/// Everything a session needs to call one model.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub canonical_name: String,
    pub upstream_model: String,
    pub provider: Arc<ProviderEntry>,
    pub multiplier: Multiplier,
    pub mode: ApiMode,
}

/// Public listing row, safe to expose to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub aliases: Vec<String>,
    pub provider: String,
    pub multiplier: Multiplier,
    pub available: bool,
    pub mode: ApiMode,
}

impl From<&ModelEntry> for ModelInfo {
    fn from(entry: &ModelEntry) -> Self {
        Self {
            id: entry.canonical_name.clone(),
            aliases: entry.aliases.iter().cloned().collect(),
            provider: entry.provider.clone(),
            multiplier: entry.multiplier,
            available: entry.available,
            mode: entry.mode,
        }
    }
}
