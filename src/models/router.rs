use std::sync::{Arc, RwLock};

use super::provider::ProviderEntry;
use super::registry::RegistrySnapshot;
use super::spec::{ModelInfo, ResolvedRoute};
use crate::tiers::{Tier, TierConfig};
use crate::{Error, Result};

/// Resolves client model names against the current registry snapshot.
///
/// Readers clone the `Arc` under a short read lock and work on that snapshot;
/// [`reload`](Self::reload) swaps in a whole new one.
pub struct ModelRouter {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ModelRouter {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn reload(&self, snapshot: RegistrySnapshot) {
        let models = snapshot.len();
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
        tracing::info!(models, "Model registry reloaded");
    }

    /// Checks run in order: unknown name, availability, tier access, credential.
    pub fn resolve(&self, requested: &str, tier: &Tier) -> Result<ResolvedRoute> {
        let snapshot = self.snapshot();

        let entry = snapshot
            .lookup(requested)
            .ok_or_else(|| Error::UnknownModel(requested.to_string()))?;

        if !entry.available {
            return Err(Error::ModelUnavailable(entry.canonical_name.clone()));
        }

        if !entry.allows(tier) {
            return Err(Error::AccessDenied {
                tier: tier.clone(),
                model: entry.canonical_name.clone(),
            });
        }

        let provider = snapshot
            .provider(&entry.provider)
            .filter(|p| p.is_configured())
            .ok_or_else(|| Error::ProviderNotConfigured(entry.provider.clone()))?;

        Ok(ResolvedRoute {
            canonical_name: entry.canonical_name.clone(),
            upstream_model: entry.upstream_name().to_string(),
            provider: Arc::clone(provider),
            multiplier: entry.multiplier,
            mode: entry.mode,
        })
    }

    pub fn tier(&self, tier: &Tier) -> Option<Arc<TierConfig>> {
        self.snapshot().tier(tier).cloned()
    }

    /// Models sorted by canonical name.
    pub fn supported_models(&self) -> Vec<ModelInfo> {
        let snapshot = self.snapshot();
        let mut models: Vec<ModelInfo> = snapshot.models().map(|m| ModelInfo::from(&**m)).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn providers(&self) -> Vec<Arc<ProviderEntry>> {
        let snapshot = self.snapshot();
        let mut providers: Vec<_> = snapshot.providers().cloned().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        providers
    }
}
