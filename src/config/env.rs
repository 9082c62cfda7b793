//! Credential lookup.
//!
//! Credentials are read once while the snapshot is built and held as
//! `SecretString` afterwards; nothing re-reads the environment per request.

use std::collections::HashMap;

pub trait CredentialSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed map, for tests and embedded setups.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}
