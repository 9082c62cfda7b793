//! End-to-end request handling: routing, quota admission, fallback and
//! accounting, against a scripted upstream and in-memory stores.
//!
//! Run: cargo nextest run --test gateway_scenarios

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use inference_proxy::config::RuntimeConfig;
use inference_proxy::models::{ApiMode, ModelEntry, ModelRouter, ProviderKind, RegistrySnapshot};
use inference_proxy::quota::Multiplier;
use inference_proxy::store::{MemoryMessageStore, MemoryQuotaStore, MemoryUsageLog, UsageRow};
use inference_proxy::tiers::{self, PeriodKind, QuotaSlot, Tier};
use inference_proxy::{Error, Gateway, ProxyRequest, RateLimitType, SessionOutcome};
use rust_decimal_macros::dec;
use serde_json::{Value, json};

struct Stack {
    gateway: Gateway,
    transport: Arc<ScriptedTransport>,
    store: MemoryQuotaStore,
    log: MemoryUsageLog,
    messages: Arc<MemoryMessageStore>,
}

fn snapshot() -> RegistrySnapshot {
    let mut gpt = ModelEntry::new("gpt-5-pro", "openai");
    gpt.multiplier = Multiplier::new(dec!(70)).unwrap();
    gpt.tier_access.insert(Tier::pro());

    let mut llama = ModelEntry::new("llama-3.3-70b", "tinfoil");
    llama.aliases.insert("llama3-3-70b".into());
    llama.upstream_model = Some("meta-llama/Llama-3.3-70B-Instruct".into());
    llama.multiplier = Multiplier::new(dec!(0.6)).unwrap();
    llama.tags.insert("free".into());

    let mut responses = ModelEntry::new("o3-deep-research", "openai");
    responses.mode = ApiMode::Responses;
    responses.tier_access.insert(Tier::pro());

    RegistrySnapshot::build(
        vec![
            provider("openai", ProviderKind::OpenAi, "https://api.openai.com/v1/"),
            provider("tinfoil", ProviderKind::Tinfoil, "https://inference.tinfoil.sh/v1/"),
        ],
        vec![gpt, llama, responses],
        tiers::builtin_tiers(),
    )
    .unwrap()
}

fn stack(script: Vec<Scripted>) -> Stack {
    let transport = ScriptedTransport::new(script);
    let store = MemoryQuotaStore::new();
    let log = MemoryUsageLog::new();
    let messages = Arc::new(MemoryMessageStore::new());
    let gateway = Gateway::builder()
        .router(Arc::new(ModelRouter::new(snapshot())))
        .transport(transport.clone())
        .quota_store(Arc::new(store.clone()))
        .usage_log(Arc::new(log.clone()))
        .messages(messages.clone())
        .runtime(RuntimeConfig {
            pipeline_workers: 2,
            shutdown_grace_secs: 5,
            ..RuntimeConfig::default()
        })
        .build()
        .unwrap();
    Stack {
        gateway,
        transport,
        store,
        log,
        messages,
    }
}

async fn seed(store: &MemoryQuotaStore, user: &str, slot: QuotaSlot, used: u64) {
    store
        .insert(UsageRow {
            tokens_used: used,
            ..UsageRow::fresh(user, slot, Utc::now())
        })
        .await;
}

fn chat_body(model: &str, stream: bool, prompt: &str) -> String {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": prompt}],
    })
    .to_string()
}

fn upstream_json(stack: &Stack, index: usize) -> Value {
    serde_json::from_slice(&stack.transport.requests()[index].body).unwrap()
}

// =============================================================================
// Pre-flight rejections
// =============================================================================

mod rejection_tests {
    use super::*;

    #[tokio::test]
    async fn test_free_tier_over_monthly_quota_is_rejected() {
        let s = stack(Vec::new());
        let monthly = QuotaSlot::primary(PeriodKind::Monthly);
        seed(&s.store, "alice", monthly, 19_500).await;

        // ~1,000 tokens of prompt at multiplier 0.6.
        let body = chat_body("llama3-3-70b", true, &"a".repeat(4_000));
        let err = s
            .gateway
            .handle(ProxyRequest::new("alice", Tier::free(), body))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 429);
        let rejection = err.rejection();
        assert_eq!(rejection.reason, "quota_exceeded");
        assert_eq!(rejection.period, Some(monthly));
        assert_eq!(rejection.rate_limit_type, Some(RateLimitType::Hard));
        assert_eq!(rejection.limit, Some(20_000));
        assert_eq!(rejection.used, Some(19_500));

        assert!(s.transport.requests().is_empty());
        s.gateway.shutdown().await;
        assert_eq!(s.store.row("alice", monthly).await.unwrap().tokens_used, 19_500);
        assert_eq!(s.log.count().await, 0);
    }

    #[tokio::test]
    async fn test_free_tier_cannot_use_pro_model() {
        let s = stack(Vec::new());
        let err = s
            .gateway
            .handle(ProxyRequest::new(
                "alice",
                Tier::free(),
                chat_body("gpt-5-pro", false, "hi"),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AccessDenied { .. }));
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.rejection().tier, Some(Tier::free()));
        assert!(s.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_and_bad_body() {
        let s = stack(Vec::new());

        let err = s
            .gateway
            .handle(ProxyRequest::new("alice", Tier::pro(), chat_body("gpt-9", false, "hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));

        let err = s
            .gateway
            .handle(ProxyRequest::new("alice", Tier::pro(), "not json"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = s
            .gateway
            .handle(ProxyRequest::new("alice", Tier::pro(), r#"{"stream":true}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_exhausted_fallback_is_soft_limit() {
        let s = stack(Vec::new());
        seed(&s.store, "bob", QuotaSlot::primary(PeriodKind::Daily), 40_000).await;
        seed(&s.store, "bob", QuotaSlot::fallback(PeriodKind::Daily), 40_000).await;

        let err = s
            .gateway
            .handle(ProxyRequest::new(
                "bob",
                Tier::plus(),
                chat_body("llama-3.3-70b", true, "hello"),
            ))
            .await
            .unwrap_err();
        let rejection = err.rejection();
        assert_eq!(rejection.period, Some(QuotaSlot::fallback(PeriodKind::Daily)));
        assert_eq!(rejection.rate_limit_type, Some(RateLimitType::Soft));
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let s = stack(Vec::new());
        s.store.set_offline(true);
        let err = s
            .gateway
            .handle(ProxyRequest::new(
                "carol",
                Tier::pro(),
                chat_body("gpt-5-pro", false, "hi"),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert!(s.transport.requests().is_empty());
    }
}

// =============================================================================
// Served requests
// =============================================================================

mod serving_tests {
    use super::*;

    #[tokio::test]
    async fn test_streamed_request_is_accounted() {
        let s = stack(vec![Scripted::event_stream(fixed_body(vec![
            delta_chunk("Sure."),
            usage_chunk(20, 80),
            done_chunk(),
        ]))]);

        let response = s
            .gateway
            .handle(
                ProxyRequest::new("dana", Tier::pro(), chat_body("gpt-5-pro", true, "hi"))
                    .chat_id("chat-9"),
            )
            .await
            .unwrap();
        assert_eq!(response.canonical_model, "gpt-5-pro");
        assert_eq!(response.provider, "openai");
        assert!(!response.fallback);

        let (collected, report) = response.session.collect().await;
        let report = report.unwrap();
        assert!(collected.failure.is_none());
        assert_eq!(report.outcome, SessionOutcome::Success);
        assert_eq!(report.raw_tokens, 100);

        let upstream = upstream_json(&s, 0);
        assert_eq!(upstream["model"], "gpt-5-pro");
        assert_eq!(upstream["stream_options"]["include_usage"], true);

        let shutdown = s.gateway.shutdown().await;
        assert!(shutdown.sessions_drained);
        assert_eq!(shutdown.accounting.abandoned, 0);

        let usage = s.gateway.usage("dana", &Tier::pro()).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].period, QuotaSlot::primary(PeriodKind::Daily));
        assert_eq!(usage[0].used, 7_000);
        assert_eq!(usage[0].remaining, 493_000);
        assert_eq!(usage[1].period, QuotaSlot::fallback(PeriodKind::Daily));
        assert_eq!(usage[1].used, 0);

        let records = s.log.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].canonical_model, "gpt-5-pro");
        assert_eq!(records[0].provider, "openai");
        assert_eq!(records[0].plan_tokens, 7_000);

        let stored = s.messages.for_user("dana").await;
        assert_eq!(stored[0].chat_id.as_deref(), Some("chat-9"));
        assert_eq!(stored[0].content, "Sure.");
    }

    #[tokio::test]
    async fn test_pro_fallback_routes_and_charges_fallback_slot() {
        let s = stack(vec![Scripted::event_stream(fixed_body(vec![
            delta_chunk("cheaper answer"),
            usage_chunk(400, 600),
            done_chunk(),
        ]))]);
        let primary = QuotaSlot::primary(PeriodKind::Daily);
        let fallback = QuotaSlot::fallback(PeriodKind::Daily);
        seed(&s.store, "erin", primary, 500_000).await;

        let response = s
            .gateway
            .handle(ProxyRequest::new(
                "erin",
                Tier::pro(),
                chat_body("gpt-5-pro", true, "summarise this"),
            ))
            .await
            .unwrap();
        assert!(response.fallback);
        assert_eq!(response.canonical_model, "llama-3.3-70b");
        assert_eq!(response.provider, "tinfoil");

        let (_, report) = response.session.collect().await;
        assert_eq!(report.unwrap().raw_tokens, 1_000);

        let request = &s.transport.requests()[0];
        assert_eq!(request.provider.name, "tinfoil");
        assert_eq!(upstream_json(&s, 0)["model"], "meta-llama/Llama-3.3-70B-Instruct");

        s.gateway.shutdown().await;
        assert_eq!(s.store.row("erin", primary).await.unwrap().tokens_used, 500_000);
        assert_eq!(s.store.row("erin", fallback).await.unwrap().tokens_used, 600);
    }

    #[tokio::test]
    async fn test_responses_mode_buffered_request() {
        let body = json!({
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "report ready"}]}],
            "usage": {"input_tokens": 5, "output_tokens": 15, "total_tokens": 20}
        })
        .to_string();
        let s = stack(vec![Scripted::json(200, &body)]);

        let response = s
            .gateway
            .handle(
                ProxyRequest::new(
                    "frank",
                    Tier::pro(),
                    json!({"model": "o3-deep-research", "input": "go"}).to_string(),
                )
                .endpoint("/v1/responses"),
            )
            .await
            .unwrap();
        let (collected, report) = response.session.collect().await;

        assert_eq!(collected.body.as_ref(), body.as_bytes());
        assert_eq!(report.unwrap().raw_tokens, 20);
        assert_eq!(s.transport.requests()[0].mode, ApiMode::Responses);
        assert!(upstream_json(&s, 0).get("stream_options").is_none());

        s.gateway.shutdown().await;
        assert_eq!(s.log.records().await[0].endpoint, "/v1/responses");
        assert_eq!(s.messages.messages().await[0].content, "report ready");
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_refused() {
        let s = stack(Vec::new());
        s.gateway.shutdown().await;
        let err = s
            .gateway
            .handle(ProxyRequest::new(
                "gina",
                Tier::pro(),
                chat_body("gpt-5-pro", false, "hi"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert_eq!(err.status_code(), 503);
    }
}
