//! # inference-proxy
//!
//! Quota-enforcing proxy core for multiple AI inference providers.
//!
//! A request arrives with a resolved user id and tier. The [`Gateway`]
//! resolves the model, checks the user's quota windows, and starts a
//! streaming session that relays the upstream response. Sessions survive
//! client disconnects, persist what they produced, and hand one accounting
//! task to a background pipeline that deducts plan tokens from the ledger.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inference_proxy::config::{EnvCredentials, GatewayConfig};
//! use inference_proxy::session::Frame;
//! use inference_proxy::{Gateway, ProxyRequest, Tier};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), inference_proxy::Error> {
//!     let config = GatewayConfig::from_file("proxy.yaml")?.with_env_overrides()?;
//!     let gateway = Gateway::from_config(&config, &EnvCredentials)?.build()?;
//!
//!     let body = r#"{"model":"llama3-3-70b","stream":true,"messages":[]}"#;
//!     let response = gateway
//!         .handle(ProxyRequest::new("user-1", Tier::plus(), body))
//!         .await?;
//!
//!     let (mut client, control) = response.session.into_parts();
//!     while let Some(frame) = client.recv().await {
//!         if let Frame::Data(chunk) = frame {
//!             print!("{}", String::from_utf8_lossy(&chunk));
//!         }
//!     }
//!     let report = control.wait().await?;
//!     println!("\n{} raw tokens", report.raw_tokens);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod accounting;
pub mod client;
pub mod config;
pub mod gateway;
pub mod models;
pub mod observability;
pub mod prelude;
pub mod quota;
pub mod resilience;
pub mod session;
pub mod store;
pub mod tiers;
pub mod tokens;

pub use accounting::{AccountingPipeline, AccountingSink, AccountingTask, EnqueueOutcome};
pub use client::{ReqwestTransport, UpstreamTransport};
pub use config::{GatewayConfig, RuntimeConfig};
pub use gateway::{Gateway, GatewayBuilder, GatewayShutdown, ProxyRequest, ProxyResponse};
pub use models::{ApiMode, ModelRouter, ProviderKind, RegistrySnapshot, ResolvedRoute};
pub use quota::{Admission, Multiplier, QuotaLedger};
pub use session::{
    FailureReason, SessionEngine, SessionHandle, SessionOutcome, SessionReport, SessionState,
};
pub use tiers::{PeriodKind, QuotaPool, QuotaSlot, Tier, TierConfig};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Error type for proxy operations.
///
/// Quota and routing errors are raised before any upstream call.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A quota window would be exceeded and no fallback can absorb it.
    #[error("Quota exceeded for {period} window of tier {tier}: {used}/{limit} plan tokens")]
    QuotaExceeded {
        period: QuotaSlot,
        tier: Tier,
        limit: u64,
        used: u64,
        resets_at: DateTime<Utc>,
    },

    #[error("Tier {tier} may not use model {model}")]
    AccessDenied { tier: Tier, model: String },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model {0} is currently unavailable")]
    ModelUnavailable(String),

    /// The provider's credential is absent from the running environment.
    #[error("Provider {0} is not configured")]
    ProviderNotConfigured(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream protocol error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamProtocol { status: Option<u16>, message: String },

    #[error("Session timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// The quota store cannot be reached; requests fail closed.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("User {user_id} already has {limit} sessions in flight")]
    ConcurrencyLimit { user_id: String, limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Proxy is shutting down")]
    ShuttingDown,
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Quota windows or per-user concurrency (429)
    Quota,
    /// Model resolution, tier access, malformed requests (4xx)
    Routing,
    /// Provider failures once forwarding has begun (5xx)
    Upstream,
    /// The proxy itself cannot serve right now (503)
    Unavailable,
    Configuration,
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::QuotaExceeded { .. } | Error::ConcurrencyLimit { .. } => ErrorCategory::Quota,

            Error::AccessDenied { .. }
            | Error::UnknownModel(_)
            | Error::ModelUnavailable(_)
            | Error::ProviderNotConfigured(_)
            | Error::InvalidRequest(_) => ErrorCategory::Routing,

            Error::UpstreamUnreachable(_)
            | Error::UpstreamProtocol { .. }
            | Error::Timeout(_)
            | Error::Network(_) => ErrorCategory::Upstream,

            Error::ServiceUnavailable(_) | Error::Store(_) | Error::ShuttingDown => {
                ErrorCategory::Unavailable
            }

            Error::Config(_) => ErrorCategory::Configuration,
            Error::Json(_) => ErrorCategory::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Error::QuotaExceeded { .. } | Error::ConcurrencyLimit { .. } => 429,
            Error::AccessDenied { .. } => 403,
            Error::UnknownModel(_) => 404,
            Error::ModelUnavailable(_) => 409,
            Error::ProviderNotConfigured(_) => 424,
            Error::InvalidRequest(_) => 400,
            Error::UpstreamUnreachable(_) | Error::UpstreamProtocol { .. } | Error::Network(_) => {
                502
            }
            Error::Timeout(_) => 504,
            Error::ServiceUnavailable(_) | Error::Store(_) | Error::ShuttingDown => 503,
            Error::Config(_) | Error::Json(_) => 500,
        }
    }

    /// Stable machine-readable code for rejection bodies.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::ConcurrencyLimit { .. } => "concurrency_limit",
            Error::AccessDenied { .. } => "access_denied",
            Error::UnknownModel(_) => "unknown_model",
            Error::ModelUnavailable(_) => "model_unavailable",
            Error::ProviderNotConfigured(_) => "provider_not_configured",
            Error::InvalidRequest(_) => "invalid_request",
            Error::UpstreamUnreachable(_) => "upstream_unreachable",
            Error::UpstreamProtocol { .. } => "upstream_protocol_error",
            Error::Network(_) => "upstream_network_error",
            Error::Timeout(_) => "timeout",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::Store(_) => "store_error",
            Error::ShuttingDown => "shutting_down",
            Error::Config(_) => "configuration_error",
            Error::Json(_) => "internal_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Upstream | ErrorCategory::Unavailable
        )
    }

    pub fn rejection(&self) -> Rejection {
        let mut rejection = Rejection {
            error: self.to_string(),
            reason: self.reason_code(),
            status: self.status_code(),
            tier: None,
            period: None,
            rate_limit_type: None,
            limit: None,
            used: None,
            resets_at: None,
        };
        match self {
            Error::QuotaExceeded {
                period,
                tier,
                limit,
                used,
                resets_at,
            } => {
                rejection.tier = Some(tier.clone());
                rejection.period = Some(*period);
                rejection.rate_limit_type = Some(match period.pool() {
                    QuotaPool::Fallback => RateLimitType::Soft,
                    QuotaPool::Primary => RateLimitType::Hard,
                });
                rejection.limit = Some(*limit);
                rejection.used = Some(*used);
                rejection.resets_at = Some(*resets_at);
            }
            Error::AccessDenied { tier, .. } => rejection.tier = Some(tier.clone()),
            _ => {}
        }
        rejection
    }
}

/// `soft` when the tier had a fallback allowance that is now spent too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitType {
    Soft,
    Hard,
}

/// Response body for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub error: String,
    pub reason: &'static str,
    #[serde(skip)]
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<QuotaSlot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_type: Option<RateLimitType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound { key } => {
                Error::Config(format!("Key not found: {}", key))
            }
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::ValidationErrors(errors) => Error::Config(errors.to_string()),
            other => Error::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
