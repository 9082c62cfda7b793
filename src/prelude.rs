//! Prelude module for convenient imports.
//!
//! ```rust
//! use inference_proxy::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

pub use crate::gateway::{Gateway, GatewayBuilder, ProxyRequest, ProxyResponse};

pub use crate::config::{EnvCredentials, GatewayConfig, RuntimeConfig};

pub use crate::models::{ApiMode, ModelRouter, ProviderKind, RegistrySnapshot, ResolvedRoute};

pub use crate::quota::{Admission, Multiplier, QuotaLedger};
pub use crate::tiers::{PeriodKind, QuotaPool, QuotaSlot, Tier, TierConfig};

pub use crate::session::{
    Frame, SessionControl, SessionEngine, SessionHandle, SessionOutcome, SessionReport,
    Subscription,
};

pub use crate::accounting::{AccountingPipeline, AccountingSink, AccountingTask};
pub use crate::client::{UpstreamRequest, UpstreamResponse, UpstreamTransport};
pub use crate::store::{MessageStore, QuotaStore, UsageLogStore};
pub use crate::tokens::TokenEstimator;
