//! Load-time validation of the registry.
//!
//! Every defect is collected before failing so an operator sees the whole
//! list in one pass.

use std::collections::{HashMap, HashSet};

use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::models::{ApiMode, ModelEntry, ProviderEntry};
use crate::tiers::TierConfig;

pub struct RegistryValidator {
    require_credentials: bool,
}

impl RegistryValidator {
    pub fn new() -> Self {
        Self {
            require_credentials: true,
        }
    }

    pub fn require_credentials(mut self, required: bool) -> Self {
        self.require_credentials = required;
        self
    }

    pub fn validate(
        &self,
        providers: &[ProviderEntry],
        models: &[ModelEntry],
        tiers: &[TierConfig],
    ) -> ConfigResult<()> {
        let errors = self.collect_errors(providers, models, tiers);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }

    pub fn collect_errors(
        &self,
        providers: &[ProviderEntry],
        models: &[ModelEntry],
        tiers: &[TierConfig],
    ) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let mut by_name: HashMap<&str, &ProviderEntry> = HashMap::new();
        for provider in providers {
            if by_name.insert(&provider.name, provider).is_some() {
                errors.push(invalid(
                    format!("providers.{}", provider.name),
                    "duplicate provider name",
                ));
            }
        }

        let mut canonical = HashSet::new();
        let mut alias_owner: HashMap<&str, &str> = HashMap::new();
        for model in models {
            let key = format!("models.{}", model.canonical_name);

            if !canonical.insert(model.canonical_name.as_str()) {
                errors.push(invalid(&key, "duplicate model name"));
            }

            for alias in &model.aliases {
                if alias.trim().is_empty() {
                    errors.push(invalid(&key, "empty alias"));
                    continue;
                }
                if let Some(owner) = alias_owner.insert(alias, &model.canonical_name)
                    && owner != model.canonical_name
                {
                    errors.push(invalid(
                        &key,
                        format!("alias '{alias}' is already used by model '{owner}'"),
                    ));
                }
            }

            let Some(provider) = by_name.get(model.provider.as_str()) else {
                errors.push(invalid(
                    &key,
                    format!("unknown provider '{}'", model.provider),
                ));
                continue;
            };

            if model.mode == ApiMode::Responses && !provider.kind.supports_responses_api() {
                errors.push(invalid(
                    &key,
                    format!(
                        "provider '{}' ({}) does not serve the responses API",
                        provider.name, provider.kind
                    ),
                ));
            }

            if self.require_credentials && model.available && !provider.is_configured() {
                errors.push(invalid(
                    format!("providers.{}", provider.name),
                    format!(
                        "missing credential{} required by model '{}'",
                        provider
                            .credential_env
                            .as_deref()
                            .map(|env| format!(" (env {env})"))
                            .unwrap_or_default(),
                        model.canonical_name
                    ),
                ));
            }
        }

        let models_by_name: HashMap<&str, &ModelEntry> = models
            .iter()
            .map(|m| (m.canonical_name.as_str(), m))
            .collect();
        let mut tier_names = HashSet::new();
        for tier in tiers {
            let key = format!("tiers.{}", tier.name);

            if !tier_names.insert(&tier.name) {
                errors.push(invalid(&key, "duplicate tier name"));
            }

            let mut kinds = HashSet::new();
            for period in &tier.quota_periods {
                if !kinds.insert(period.kind) {
                    errors.push(invalid(&key, format!("duplicate {} period", period.kind)));
                }
                if period.limit == 0 {
                    errors.push(invalid(&key, format!("{} limit must be positive", period.kind)));
                }
            }

            if let Some(fallback) = &tier.fallback {
                if fallback.limit == 0 {
                    errors.push(invalid(&key, "fallback limit must be positive"));
                }
                match models_by_name.get(fallback.model.as_str()) {
                    None => errors.push(invalid(
                        &key,
                        format!("fallback model '{}' is not registered", fallback.model),
                    )),
                    Some(model) if !model.allows(&tier.name) => errors.push(invalid(
                        &key,
                        format!("fallback model '{}' is not accessible to the tier", fallback.model),
                    )),
                    Some(_) => {}
                }
            }
        }

        errors
    }
}

impl Default for RegistryValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(key: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use crate::tiers::{PeriodKind, Tier};
    use url::Url;

    fn openai(credential: bool) -> ProviderEntry {
        let entry = ProviderEntry::new(
            "openai",
            ProviderKind::OpenAi,
            Url::parse("https://api.openai.com/v1/").unwrap(),
        );
        if credential {
            entry.with_credential("sk-test")
        } else {
            entry
        }
    }

    fn model(name: &str) -> ModelEntry {
        let mut model = ModelEntry::new(name, "openai");
        model.tier_access.insert(Tier::free());
        model
    }

    fn messages(errors: &[ConfigError]) -> Vec<String> {
        errors.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_valid_registry() {
        let tier = TierConfig::new("free").period(PeriodKind::Monthly, 100);
        assert!(
            RegistryValidator::new()
                .validate(&[openai(true)], &[model("gpt-4o")], &[tier])
                .is_ok()
        );
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut a = model("gpt-4o");
        a.aliases.insert("shared".into());
        let mut b = model("gpt-4o-mini");
        b.aliases.insert("shared".into());

        let errors = RegistryValidator::new().collect_errors(&[openai(true)], &[a, b], &[]);
        assert_eq!(errors.len(), 1);
        assert!(messages(&errors)[0].contains("alias 'shared'"));
    }

    #[test]
    fn test_canonical_name_collides_with_alias() {
        let mut a = model("gpt-4o");
        a.aliases.insert("gpt-4o-mini".into());
        let b = model("gpt-4o-mini");

        let errors = RegistryValidator::new().collect_errors(&[openai(true)], &[a, b], &[]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_collects_every_defect() {
        let mut orphan = model("orphan");
        orphan.provider = "nowhere".into();
        let tier = TierConfig::new("free")
            .period(PeriodKind::Daily, 0)
            .fallback(PeriodKind::Daily, 10, "missing-model");

        let errors = RegistryValidator::new().collect_errors(
            &[openai(false)],
            &[model("gpt-4o"), orphan],
            &[tier],
        );
        let text = messages(&errors).join("\n");
        assert_eq!(errors.len(), 4, "{text}");
        assert!(text.contains("missing credential"));
        assert!(text.contains("unknown provider 'nowhere'"));
        assert!(text.contains("limit must be positive"));
        assert!(text.contains("'missing-model' is not registered"));
    }

    #[test]
    fn test_credentials_optional_when_lenient() {
        let errors = RegistryValidator::new()
            .require_credentials(false)
            .collect_errors(&[openai(false)], &[model("gpt-4o")], &[]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_unavailable_model_needs_no_credential() {
        let mut retired = model("gpt-4");
        retired.available = false;
        let errors = RegistryValidator::new().collect_errors(&[openai(false)], &[retired], &[]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_responses_mode_requires_capable_provider() {
        let tinfoil = ProviderEntry::new(
            "tinfoil",
            ProviderKind::Tinfoil,
            Url::parse("https://inference.tinfoil.sh/v1/").unwrap(),
        )
        .with_credential("tf");
        let mut m = ModelEntry::new("deepseek-r1", "tinfoil");
        m.mode = ApiMode::Responses;

        let errors = RegistryValidator::new().collect_errors(&[tinfoil], &[m], &[]);
        assert_eq!(errors.len(), 1);
        assert!(messages(&errors)[0].contains("responses API"));
    }
}
