//! Registry and runtime configuration.
//!
//! ```rust,no_run
//! use inference_proxy::config::{EnvCredentials, GatewayConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_file("proxy.yaml")?.with_env_overrides()?;
//! let snapshot = config.build_snapshot(&EnvCredentials)?;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod file;
pub mod runtime;
pub mod validator;

pub use env::{CredentialSource, EnvCredentials, StaticCredentials};
pub use file::{GatewayConfig, ModelConfig, ProviderConfig};
pub use runtime::RuntimeConfig;
pub use validator::RegistryValidator;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl ValidationErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
