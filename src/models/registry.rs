use std::collections::HashMap;
use std::sync::Arc;

use super::provider::ProviderEntry;
use super::spec::ModelEntry;
use crate::config::{ConfigResult, RegistryValidator};
use crate::tiers::{Tier, TierConfig};

/// Immutable view of providers, models and tiers.
///
/// Built and validated wholesale; never mutated after construction.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    providers: HashMap<String, Arc<ProviderEntry>>,
    models: HashMap<String, Arc<ModelEntry>>,
    aliases: HashMap<String, String>,
    tiers: HashMap<Tier, Arc<TierConfig>>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validates the parts and indexes them.
    ///
    /// Model `tier_access` is widened with every tier whose
    /// `allowed_model_tags` matches one of the model's tags.
    pub fn build(
        providers: Vec<ProviderEntry>,
        models: Vec<ModelEntry>,
        tiers: Vec<TierConfig>,
    ) -> ConfigResult<Self> {
        Self::assemble(RegistryValidator::new(), providers, models, tiers)
    }

    /// Like [`build`](Self::build) but tolerates providers without a
    /// credential; requests to their models fail at resolve time instead.
    pub fn build_lenient(
        providers: Vec<ProviderEntry>,
        models: Vec<ModelEntry>,
        tiers: Vec<TierConfig>,
    ) -> ConfigResult<Self> {
        Self::assemble(
            RegistryValidator::new().require_credentials(false),
            providers,
            models,
            tiers,
        )
    }

    fn assemble(
        validator: RegistryValidator,
        providers: Vec<ProviderEntry>,
        mut models: Vec<ModelEntry>,
        tiers: Vec<TierConfig>,
    ) -> ConfigResult<Self> {
        for model in &mut models {
            model.aliases.insert(model.canonical_name.clone());
            for tier in &tiers {
                if tier.allowed_model_tags.contains("*")
                    || model.tags.iter().any(|tag| tier.grants_tag(tag))
                {
                    model.tier_access.insert(tier.name.clone());
                }
            }
        }

        validator.validate(&providers, &models, &tiers)?;

        let mut aliases = HashMap::new();
        for model in &models {
            for alias in &model.aliases {
                aliases.insert(alias.clone(), model.canonical_name.clone());
            }
        }

        Ok(Self {
            providers: providers
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
            models: models
                .into_iter()
                .map(|m| (m.canonical_name.clone(), Arc::new(m)))
                .collect(),
            aliases,
            tiers: tiers
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
        })
    }

    /// Exact, case-sensitive alias lookup.
    pub fn lookup(&self, requested: &str) -> Option<&Arc<ModelEntry>> {
        self.aliases
            .get(requested)
            .and_then(|canonical| self.models.get(canonical))
    }

    pub fn model(&self, canonical_name: &str) -> Option<&Arc<ModelEntry>> {
        self.models.get(canonical_name)
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<ProviderEntry>> {
        self.providers.get(name)
    }

    pub fn tier(&self, tier: &Tier) -> Option<&Arc<TierConfig>> {
        self.tiers.get(tier)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelEntry>> {
        self.models.values()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderEntry>> {
        self.providers.values()
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Arc<TierConfig>> {
        self.tiers.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
