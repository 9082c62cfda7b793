//! On-disk YAML document.
//!
//! ```yaml
//! providers:
//!   - name: openai
//!     kind: openai
//!     base_url: https://api.openai.com/v1
//!     credential_env: OPENAI_API_KEY
//! models:
//!   - name: gpt-5-pro
//!     provider: openai
//!     multiplier: 70
//!     tier_access: [pro]
//!     mode: responses
//! runtime:
//!   pipeline_workers: 4
//! ```
//!
//! `tiers` may be omitted, in which case the built-in free/plus/pro table applies.

use std::collections::BTreeSet;
use std::path::Path;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use super::env::CredentialSource;
use super::runtime::RuntimeConfig;
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::models::{ApiMode, ModelEntry, ProviderEntry, ProviderKind, RegistrySnapshot};
use crate::quota::Multiplier;
use crate::tiers::{self, Tier, TierConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub credential_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub provider: String,
    #[serde(default)]
    pub upstream_model: Option<String>,
    #[serde(default = "default_multiplier")]
    pub multiplier: Multiplier,
    #[serde(default)]
    pub tier_access: BTreeSet<Tier>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub mode: ApiMode,
}

fn default_multiplier() -> Multiplier {
    Multiplier::ONE
}

fn default_available() -> bool {
    true
}

impl ModelConfig {
    fn to_entry(&self) -> ModelEntry {
        let mut entry = ModelEntry::new(&self.name, &self.provider);
        entry.aliases.extend(self.aliases.iter().cloned());
        entry.upstream_model = self.upstream_model.clone();
        entry.multiplier = self.multiplier;
        entry.tier_access = self.tier_access.clone();
        entry.tags = self.tags.clone();
        entry.available = self.available;
        entry.mode = self.mode;
        entry
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub tiers: Option<Vec<TierConfig>>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl GatewayConfig {
    pub fn from_yaml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml_bw::from_str(source)?;
        config.runtime.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&source)?;
        tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            models = config.models.len(),
            "Loaded gateway configuration"
        );
        Ok(config)
    }

    /// Applies `PROXY_*` environment overrides to the runtime section.
    pub fn with_env_overrides(mut self) -> ConfigResult<Self> {
        self.runtime = self.runtime.apply_env(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    pub fn tier_configs(&self) -> Vec<TierConfig> {
        let mut tiers = self.tiers.clone().unwrap_or_else(tiers::builtin_tiers);
        if (self.runtime.daily_limit_scale - 1.0).abs() > f64::EPSILON {
            for tier in &mut tiers {
                tier.scale_daily(self.runtime.daily_limit_scale);
            }
        }
        tiers
    }

    /// Resolves URLs and credentials, then validates the whole registry.
    pub fn build_snapshot(&self, credentials: &dyn CredentialSource) -> ConfigResult<RegistrySnapshot> {
        let mut errors = Vec::new();
        let mut providers = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let base_url = match Url::parse(&provider.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                Ok(url) => {
                    errors.push(ConfigError::InvalidValue {
                        key: format!("providers.{}.base_url", provider.name),
                        message: format!("unsupported scheme '{}'", url.scheme()),
                    });
                    continue;
                }
                Err(e) => {
                    errors.push(ConfigError::InvalidValue {
                        key: format!("providers.{}.base_url", provider.name),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let mut entry = ProviderEntry::new(&provider.name, provider.kind, base_url);
            entry.credential_env = provider.credential_env.clone();
            entry.credential = provider
                .credential_env
                .as_deref()
                .and_then(|env| credentials.lookup(env))
                .map(SecretString::from);
            providers.push(entry);
        }

        let models = self.models.iter().map(ModelConfig::to_entry).collect();
        let tiers = self.tier_configs();

        let built = if self.runtime.require_credentials {
            RegistrySnapshot::build(providers, models, tiers)
        } else {
            RegistrySnapshot::build_lenient(providers, models, tiers)
        };

        match built {
            Ok(snapshot) if errors.is_empty() => {
                tracing::info!(models = snapshot.len(), "Registry snapshot built");
                Ok(snapshot)
            }
            Ok(_) => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
            Err(ConfigError::ValidationErrors(ValidationErrors(more))) => {
                errors.extend(more);
                Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
            }
            Err(other) => Err(other),
        }
    }
}
