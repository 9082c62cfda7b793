//! Request entry point.
//!
//! [`Gateway::handle`] runs the pre-flight path synchronously (route
//! resolution and the quota check) so that every quota or routing rejection
//! happens before anything is sent upstream. It then starts a session and
//! returns its handle.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::accounting::{AccountingPipeline, PipelineConfig, ShutdownReport};
use crate::client::{PoolConfig, ReqwestTransport, UpstreamTransport};
use crate::config::{ConfigError, CredentialSource, GatewayConfig, RuntimeConfig};
use crate::models::{ApiMode, ModelInfo, ModelRouter, ResolvedRoute};
use crate::observability::{GatewayMetrics, MetricsSnapshot};
use crate::quota::{Admission, PeriodUsage, QuotaLedger};
use crate::session::{EngineConfig, SessionEngine, SessionHandle, SessionRequest};
use crate::store::{
    MemoryMessageStore, MemoryQuotaStore, MemoryUsageLog, MessageStore, QuotaStore, UsageLogStore,
};
use crate::tiers::{QuotaPool, Tier};
use crate::tokens::{CharRatioEstimator, TokenEstimator};
use crate::{Error, Result};

/// An authenticated request: identity and tier come from the auth layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub user_id: String,
    pub tier: Tier,
    /// Path the client called, recorded in the usage log.
    pub endpoint: String,
    pub chat_id: Option<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(user_id: impl Into<String>, tier: Tier, body: impl Into<Bytes>) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            endpoint: "/v1/chat/completions".to_string(),
            chat_id: None,
            body: body.into(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub session: SessionHandle,
    /// Model actually served; differs from the requested one on fallback.
    pub canonical_model: String,
    pub provider: String,
    pub fallback: bool,
    /// Plan tokens used for the pre-flight check.
    pub estimated_plan_tokens: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayShutdown {
    pub sessions_drained: bool,
    pub accounting: ShutdownReport,
}

pub struct Gateway {
    router: Arc<ModelRouter>,
    ledger: Arc<QuotaLedger>,
    engine: SessionEngine,
    pipeline: Arc<AccountingPipeline>,
    estimator: Arc<dyn TokenEstimator>,
    metrics: Arc<GatewayMetrics>,
    runtime: RuntimeConfig,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Builder seeded from a loaded configuration document.
    pub fn from_config(
        config: &GatewayConfig,
        credentials: &dyn CredentialSource,
    ) -> Result<GatewayBuilder> {
        let snapshot = config.build_snapshot(credentials)?;
        Ok(Self::builder()
            .router(Arc::new(ModelRouter::new(snapshot)))
            .runtime(config.runtime.clone()))
    }

    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let mut payload: Map<String, Value> = match serde_json::from_slice(&request.body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(Error::InvalidRequest("body must be a JSON object".into())),
            Err(e) => return Err(Error::InvalidRequest(format!("body is not valid JSON: {e}"))),
        };
        let requested = payload
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidRequest("missing 'model'".into()))?;
        let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let tier = self.router.tier(&request.tier).ok_or_else(|| Error::AccessDenied {
            tier: request.tier.clone(),
            model: requested.clone(),
        })?;

        let mut route = self.router.resolve(&requested, &request.tier)?;
        let estimated_raw = self.estimator.estimate_bytes(&request.body);
        let estimated_plan_tokens = route.multiplier.plan_tokens(estimated_raw);

        let pool = match self
            .ledger
            .check_and_reserve(&request.user_id, &tier, estimated_plan_tokens)
            .await?
        {
            Admission::Allowed => QuotaPool::Primary,
            Admission::Fallback { model } => {
                tracing::info!(
                    user_id = %request.user_id,
                    tier = %request.tier,
                    requested = %requested,
                    fallback = %model,
                    "Primary quota exhausted; routing to fallback model"
                );
                route = self.router.resolve(&model, &request.tier)?;
                QuotaPool::Fallback
            }
            Admission::Denied(denial) => {
                tracing::info!(
                    user_id = %request.user_id,
                    tier = %request.tier,
                    period = %denial.slot,
                    used = denial.used,
                    limit = denial.limit,
                    "Request rejected by quota"
                );
                return Err(Error::QuotaExceeded {
                    period: denial.slot,
                    tier: request.tier,
                    limit: denial.limit,
                    used: denial.used,
                    resets_at: denial.resets_at,
                });
            }
        };

        rewrite_body(&mut payload, &route, stream);
        let body = Bytes::from(serde_json::to_vec(&Value::Object(payload))?);

        let canonical_model = route.canonical_name.clone();
        let provider = route.provider.name.clone();
        let session = self.engine.start(SessionRequest {
            user_id: request.user_id,
            tier: request.tier,
            chat_id: request.chat_id,
            endpoint: request.endpoint,
            route,
            pool,
            body,
            stream,
        })?;

        Ok(ProxyResponse {
            session,
            canonical_model,
            provider,
            fallback: pool == QuotaPool::Fallback,
            estimated_plan_tokens,
        })
    }

    /// Per-window usage for a status endpoint.
    pub async fn usage(&self, user_id: &str, tier: &Tier) -> Result<Vec<PeriodUsage>> {
        let config = self.router.tier(tier).ok_or_else(|| Error::AccessDenied {
            tier: tier.clone(),
            model: String::new(),
        })?;
        self.ledger.usage(user_id, &config).await
    }

    pub fn supported_models(&self) -> Vec<ModelInfo> {
        self.router.supported_models()
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drains sessions first so their accounting tasks reach the pipeline,
    /// then drains the pipeline. Each stage gets the configured grace period.
    pub async fn shutdown(&self) -> GatewayShutdown {
        let grace = self.runtime.shutdown_grace();
        let sessions_drained = self.engine.shutdown(grace).await;
        let accounting = self.pipeline.shutdown(grace).await;
        GatewayShutdown {
            sessions_drained,
            accounting,
        }
    }
}

/// Points the body at the upstream model and asks for streamed usage where
/// the provider only reports it on request.
fn rewrite_body(payload: &mut Map<String, Value>, route: &ResolvedRoute, stream: bool) {
    payload.insert("model".into(), Value::String(route.upstream_model.clone()));

    if stream && route.mode == ApiMode::Standard && route.provider.kind.requests_stream_usage() {
        let options = payload
            .entry("stream_options")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(options) = options {
            options.insert("include_usage".into(), Value::Bool(true));
        }
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    router: Option<Arc<ModelRouter>>,
    quota_store: Option<Arc<dyn QuotaStore>>,
    usage_log: Option<Arc<dyn UsageLogStore>>,
    messages: Option<Arc<dyn MessageStore>>,
    transport: Option<Arc<dyn UpstreamTransport>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    metrics: Option<Arc<GatewayMetrics>>,
    runtime: Option<RuntimeConfig>,
}

impl GatewayBuilder {
    pub fn router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn quota_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.quota_store = Some(store);
        self
    }

    pub fn usage_log(mut self, store: Arc<dyn UsageLogStore>) -> Self {
        self.usage_log = Some(store);
        self
    }

    pub fn messages(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.messages = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn UpstreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Wires the components and starts the accounting workers.
    ///
    /// Must be called inside a Tokio runtime. Unset stores default to the
    /// in-memory backends and the transport to a pooled reqwest client.
    pub fn build(self) -> Result<Gateway> {
        let router = self.router.ok_or_else(|| ConfigError::NotFound {
            key: "router".into(),
        })?;
        let runtime = self.runtime.unwrap_or_default();
        runtime.validate()?;

        let quota_store = self
            .quota_store
            .unwrap_or_else(|| Arc::new(MemoryQuotaStore::new()));
        let usage_log = self
            .usage_log
            .unwrap_or_else(|| Arc::new(MemoryUsageLog::new()));
        let messages = self
            .messages
            .unwrap_or_else(|| Arc::new(MemoryMessageStore::new()));
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(ReqwestTransport::new(PoolConfig::from_runtime(&runtime)))
        });
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(CharRatioEstimator::default()));
        let metrics = self.metrics.unwrap_or_default();

        let ledger = Arc::new(QuotaLedger::new(quota_store));
        let pipeline = Arc::new(AccountingPipeline::start(
            PipelineConfig::from_runtime(&runtime),
            ledger.clone(),
            router.clone(),
            usage_log,
            metrics.clone(),
        ));
        let engine = SessionEngine::new(
            transport,
            pipeline.clone(),
            messages,
            estimator.clone(),
            EngineConfig::from_runtime(&runtime),
            metrics.clone(),
        );

        Ok(Gateway {
            router,
            ledger,
            engine,
            pipeline,
            estimator,
            metrics,
            runtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderEntry, ProviderKind};
    use crate::quota::Multiplier;
    use serde_json::json;
    use url::Url;

    fn route(kind: ProviderKind, mode: ApiMode) -> ResolvedRoute {
        ResolvedRoute {
            canonical_name: "llama-3.3-70b".into(),
            upstream_model: "meta-llama/Llama-3.3-70B".into(),
            provider: Arc::new(
                ProviderEntry::new("p", kind, Url::parse("https://example.com/v1/").unwrap())
                    .with_credential("k"),
            ),
            multiplier: Multiplier::ONE,
            mode,
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_rewrite_sets_upstream_model_and_usage_flag() {
        let mut payload = object(json!({"model": "llama3-3-70b", "stream": true}));
        rewrite_body(&mut payload, &route(ProviderKind::Tinfoil, ApiMode::Standard), true);
        assert_eq!(payload["model"], "meta-llama/Llama-3.3-70B");
        assert_eq!(payload["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_rewrite_keeps_existing_stream_options() {
        let mut payload = object(json!({"model": "m", "stream_options": {"foo": 1}}));
        rewrite_body(&mut payload, &route(ProviderKind::OpenAi, ApiMode::Standard), true);
        assert_eq!(payload["stream_options"]["foo"], 1);
        assert_eq!(payload["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_rewrite_skips_usage_flag_when_not_needed() {
        let mut anthropic = object(json!({"model": "m"}));
        rewrite_body(&mut anthropic, &route(ProviderKind::Anthropic, ApiMode::Standard), true);
        assert!(!anthropic.contains_key("stream_options"));

        let mut responses = object(json!({"model": "m"}));
        rewrite_body(&mut responses, &route(ProviderKind::OpenAi, ApiMode::Responses), true);
        assert!(!responses.contains_key("stream_options"));

        let mut buffered = object(json!({"model": "m"}));
        rewrite_body(&mut buffered, &route(ProviderKind::OpenAi, ApiMode::Standard), false);
        assert!(!buffered.contains_key("stream_options"));
    }
}
