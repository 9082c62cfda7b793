use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use super::spec::ApiMode;

/// Closed set of upstream families, resolved once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(alias = "openai")]
    OpenAi,
    Anthropic,
    #[serde(alias = "openrouter")]
    OpenRouter,
    Tinfoil,
    /// Any self-hosted server speaking the chat-completions dialect.
    #[serde(alias = "openai-compatible")]
    OpenAiCompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>` plus a pinned `anthropic-version`.
    XApiKey,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Tinfoil => "tinfoil",
            Self::OpenAiCompatible => "openai_compatible",
        }
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        match self {
            Self::Anthropic => AuthScheme::XApiKey,
            _ => AuthScheme::Bearer,
        }
    }

    /// Streaming chat completions only carry a usage record when asked for one.
    pub fn requests_stream_usage(&self) -> bool {
        matches!(
            self,
            Self::OpenAi | Self::OpenRouter | Self::Tinfoil | Self::OpenAiCompatible
        )
    }

    pub fn supports_responses_api(&self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: Url,
    /// Environment variable the credential was read from.
    pub credential_env: Option<String>,
    pub credential: Option<SecretString>,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, kind: ProviderKind, base_url: Url) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url,
            credential_env: None,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(SecretString::from(credential.into()));
        self
    }

    pub fn is_configured(&self) -> bool {
        self.credential
            .as_ref()
            .is_some_and(|c| !c.expose_secret().is_empty())
    }

    /// Full URL for the endpoint serving `mode`.
    pub fn endpoint(&self, mode: ApiMode) -> Url {
        let path = match mode {
            ApiMode::Standard => "chat/completions",
            ApiMode::Responses => "responses",
        };
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path).unwrap_or(base)
    }
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url.as_str())
            .field("credential_env", &self.credential_env)
            .field("configured", &self.is_configured())
            .finish()
    }
}
