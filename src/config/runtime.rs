//! Tunables for the session engine, accounting pipeline and transport.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult, ValidationErrors};

pub const ENV_PREFIX: &str = "PROXY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline_workers: usize,
    pub queue_capacity: usize,
    /// Attempts per accounting task before it is abandoned.
    pub accounting_max_attempts: u32,
    pub shutdown_grace_secs: u64,
    pub session_deadline_secs: u64,
    pub persist_grace_secs: u64,
    pub max_response_bytes: usize,
    /// Chunks queued per subscriber before sends start waiting on it.
    pub subscriber_buffer: usize,
    /// Wait on a full subscriber before detaching it.
    pub subscriber_patience_ms: u64,
    pub max_sessions_per_user: Option<usize>,
    /// Scales every daily limit; used to shrink allowances on staging.
    pub daily_limit_scale: f64,
    pub connect_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    pub require_credentials: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pipeline_workers: 4,
            queue_capacity: 1024,
            accounting_max_attempts: 3,
            shutdown_grace_secs: 30,
            session_deadline_secs: 600,
            persist_grace_secs: 5,
            max_response_bytes: 32 * 1024 * 1024,
            subscriber_buffer: 256,
            subscriber_patience_ms: 100,
            max_sessions_per_user: None,
            daily_limit_scale: 1.0,
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            require_credentials: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `PROXY_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Overrides fields from `lookup`, keyed by `PROXY_<FIELD>` in upper case.
    pub fn apply_env<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();
        let var = |field: &str| {
            let key = format!("{ENV_PREFIX}{}", field.to_uppercase());
            lookup(&key).map(|value| (key, value))
        };

        override_field(&mut self.pipeline_workers, var("pipeline_workers"), &mut errors);
        override_field(&mut self.queue_capacity, var("queue_capacity"), &mut errors);
        override_field(
            &mut self.accounting_max_attempts,
            var("accounting_max_attempts"),
            &mut errors,
        );
        override_field(&mut self.shutdown_grace_secs, var("shutdown_grace_secs"), &mut errors);
        override_field(
            &mut self.session_deadline_secs,
            var("session_deadline_secs"),
            &mut errors,
        );
        override_field(&mut self.persist_grace_secs, var("persist_grace_secs"), &mut errors);
        override_field(&mut self.max_response_bytes, var("max_response_bytes"), &mut errors);
        override_field(&mut self.subscriber_buffer, var("subscriber_buffer"), &mut errors);
        override_field(
            &mut self.subscriber_patience_ms,
            var("subscriber_patience_ms"),
            &mut errors,
        );
        override_field(&mut self.daily_limit_scale, var("daily_limit_scale"), &mut errors);
        override_field(&mut self.connect_timeout_secs, var("connect_timeout_secs"), &mut errors);
        override_field(
            &mut self.pool_idle_timeout_secs,
            var("pool_idle_timeout_secs"),
            &mut errors,
        );
        override_field(&mut self.require_credentials, var("require_credentials"), &mut errors);

        if let Some((key, value)) = var("max_sessions_per_user") {
            match value.trim() {
                "" | "none" | "0" => self.max_sessions_per_user = None,
                raw => match raw.parse() {
                    Ok(n) => self.max_sessions_per_user = Some(n),
                    Err(_) => errors.push(ConfigError::InvalidValue {
                        key,
                        message: format!("expected a positive integer, got '{raw}'"),
                    }),
                },
            }
        }

        errors.extend(self.check());
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }

    fn check(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut require = |ok: bool, key: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::InvalidValue {
                    key: format!("runtime.{key}"),
                    message: message.to_string(),
                });
            }
        };
        require(self.pipeline_workers > 0, "pipeline_workers", "must be at least 1");
        require(self.queue_capacity > 0, "queue_capacity", "must be at least 1");
        require(
            self.accounting_max_attempts > 0,
            "accounting_max_attempts",
            "must be at least 1",
        );
        require(self.subscriber_buffer > 0, "subscriber_buffer", "must be at least 1");
        require(
            self.session_deadline_secs > 0,
            "session_deadline_secs",
            "must be positive",
        );
        require(
            self.daily_limit_scale.is_finite() && self.daily_limit_scale > 0.0,
            "daily_limit_scale",
            "must be a positive number",
        );
        errors
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let errors = self.check();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.session_deadline_secs)
    }

    pub fn persist_grace(&self) -> Duration {
        Duration::from_secs(self.persist_grace_secs)
    }

    pub fn subscriber_patience(&self) -> Duration {
        Duration::from_millis(self.subscriber_patience_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

fn override_field<T: FromStr>(
    field: &mut T,
    value: Option<(String, String)>,
    errors: &mut Vec<ConfigError>,
) {
    let Some((key, raw)) = value else {
        return;
    };
    match raw.trim().parse() {
        Ok(parsed) => *field = parsed,
        Err(_) => errors.push(ConfigError::InvalidValue {
            key,
            message: format!("cannot parse '{raw}'"),
        }),
    }
}
