//! Session engine behaviour against a scripted upstream.
//!
//! Run: cargo nextest run --test session_engine_tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use inference_proxy::Error;
use inference_proxy::client::ReadError;
use inference_proxy::observability::GatewayMetrics;
use inference_proxy::session::{
    EngineConfig, FailureReason, Frame, SessionEngine, SessionOutcome, SessionRequest, SessionState,
};
use inference_proxy::store::MemoryMessageStore;
use inference_proxy::tiers::{QuotaPool, Tier};
use inference_proxy::tokens::CharRatioEstimator;
use rust_decimal_macros::dec;

struct Harness {
    engine: SessionEngine,
    sink: Arc<RecordingSink>,
    messages: Arc<MemoryMessageStore>,
    metrics: Arc<GatewayMetrics>,
}

fn harness(transport: Arc<ScriptedTransport>, config: EngineConfig) -> Harness {
    let sink = RecordingSink::new();
    let messages = Arc::new(MemoryMessageStore::new());
    let metrics = Arc::new(GatewayMetrics::new());
    let engine = SessionEngine::new(
        transport,
        sink.clone(),
        messages.clone(),
        Arc::new(CharRatioEstimator::default()),
        config,
        metrics.clone(),
    );
    Harness {
        engine,
        sink,
        messages,
        metrics,
    }
}

fn request(user: &str, stream: bool) -> SessionRequest {
    SessionRequest {
        user_id: user.to_string(),
        tier: Tier::pro(),
        chat_id: Some("chat-1".to_string()),
        endpoint: "/v1/chat/completions".to_string(),
        route: route("gpt-5-pro", dec!(70)),
        pool: QuotaPool::Primary,
        body: Bytes::from_static(br#"{"model":"gpt-5-pro","stream":true}"#),
        stream,
    }
}

// =============================================================================
// Disconnect tolerance
// =============================================================================

mod disconnect_tests {
    use super::*;

    #[tokio::test]
    async fn test_client_cancel_after_partial_stream_is_accounted() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig::default(),
        );
        let (mut client, control) = h.engine.start(request("alice", true)).unwrap().into_parts();

        let content = "x".repeat(400);
        for _ in 0..36 {
            tx.unbounded_send(Ok(delta_chunk(&content))).unwrap();
        }

        assert!(matches!(client.recv().await, Some(Frame::Head(head)) if head.status == 200));
        let mut received = 0;
        while received < 36 {
            match client.recv().await {
                Some(Frame::Data(_)) => received += 1,
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        drop(client);
        tx.unbounded_send(Err(ReadError::cancelled("request cancelled")))
            .unwrap();

        let report = control.wait().await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::PartialSuccess);
        assert_eq!(report.state, SessionState::Completed);
        assert!(report.failure.is_none());
        assert_eq!(report.raw_tokens, 3_600);
        assert!(!report.usage_reported);
        assert!(report.persisted);
        assert!(report.accounting_enqueued);

        let tasks = h.sink.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].raw_tokens, 3_600);
        assert_eq!(tasks[0].plan_tokens(), 252_000);
        assert_eq!(tasks[0].outcome, SessionOutcome::PartialSuccess);
        assert_eq!(tasks[0].session_id, report.session_id);

        let stored = h.messages.for_user("alice").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content.len(), 36 * 400);
        assert_eq!(stored[0].chat_id.as_deref(), Some("chat-1"));
        assert_eq!(stored[0].role, "assistant");
    }

    #[tokio::test]
    async fn test_session_keeps_reading_after_client_leaves() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig::default(),
        );
        let (client, control) = h.engine.start(request("alice", true)).unwrap().into_parts();
        drop(client);

        tx.unbounded_send(Ok(delta_chunk("Hello, "))).unwrap();
        tx.unbounded_send(Ok(delta_chunk("world"))).unwrap();
        tx.unbounded_send(Ok(usage_chunk(10, 5))).unwrap();
        drop(tx);

        let report = control.wait().await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Success);
        assert_eq!(report.raw_tokens, 15);
        assert!(report.usage_reported);

        let stored = h.messages.messages().await;
        assert_eq!(stored[0].content, "Hello, world");
        assert_eq!(h.sink.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_with_client_present_is_protocol_error() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig::default(),
        );
        let handle = h.engine.start(request("alice", true)).unwrap();

        tx.unbounded_send(Ok(delta_chunk("partial"))).unwrap();
        tx.unbounded_send(Err(ReadError::cancelled("reset by peer")))
            .unwrap();

        let (collected, report) = handle.collect().await;
        let report = report.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Failure);
        assert!(matches!(
            report.failure,
            Some(FailureReason::ProtocolError {
                status: Some(200),
                ..
            })
        ));
        assert!(matches!(collected.failure, Some(FailureReason::ProtocolError { .. })));
    }
}

// =============================================================================
// Natural completion
// =============================================================================

mod completion_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_with_reported_usage() {
        let chunks = vec![
            delta_chunk("The answer "),
            delta_chunk("is 42."),
            usage_chunk(12, 30),
            done_chunk(),
        ];
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(fixed_body(chunks))]),
            EngineConfig::default(),
        );

        let (collected, report) = h.engine.start(request("bob", true)).unwrap().collect().await;
        let report = report.unwrap();

        assert_eq!(collected.body.as_ref(), expected.as_slice());
        assert_eq!(collected.frames, 4);
        assert!(collected.head.unwrap().streaming);
        assert!(collected.failure.is_none());

        assert_eq!(report.outcome, SessionOutcome::Success);
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.raw_tokens, 42);
        assert!(report.usage_reported);
        assert_eq!(report.bytes, expected.len());

        let stored = h.messages.messages().await;
        assert_eq!(stored[0].content, "The answer is 42.");
        assert_eq!(stored[0].raw_tokens, 42);

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.sessions_completed, 1);
        assert_eq!(snapshot.raw_tokens, 42);
    }

    #[tokio::test]
    async fn test_buffered_json_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}],"usage":{"total_tokens":17}}"#;
        let h = harness(
            ScriptedTransport::new([Scripted::json(200, body)]),
            EngineConfig::default(),
        );

        let (collected, report) = h.engine.start(request("bob", false)).unwrap().collect().await;
        let report = report.unwrap();

        let head = collected.head.unwrap();
        assert_eq!(head.status, 200);
        assert!(!head.streaming);
        assert_eq!(collected.frames, 1);
        assert_eq!(collected.body.as_ref(), body.as_bytes());
        assert_eq!(report.raw_tokens, 17);
        assert_eq!(h.messages.messages().await[0].content, "hi there");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_prefix_then_live_chunks() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig::default(),
        );
        let (mut client, control) = h.engine.start(request("carol", true)).unwrap().into_parts();

        let first = delta_chunk("one ");
        let second = delta_chunk("two ");
        tx.unbounded_send(Ok(first.clone())).unwrap();
        tx.unbounded_send(Ok(second.clone())).unwrap();
        assert!(matches!(client.recv().await, Some(Frame::Head(_))));
        assert_eq!(client.recv().await, Some(Frame::Data(first.clone())));
        assert_eq!(client.recv().await, Some(Frame::Data(second.clone())));

        let mut late = control.subscribe().await.unwrap();
        assert!(matches!(late.recv().await, Some(Frame::Head(head)) if head.streaming));
        let mut prefix = first.to_vec();
        prefix.extend_from_slice(&second);
        assert_eq!(late.recv().await, Some(Frame::Data(Bytes::from(prefix))));

        let third = delta_chunk("three");
        tx.unbounded_send(Ok(third.clone())).unwrap();
        drop(tx);

        assert_eq!(late.recv().await, Some(Frame::Data(third.clone())));
        assert_eq!(late.recv().await, None);
        assert_eq!(client.recv().await, Some(Frame::Data(third)));
        assert_eq!(client.recv().await, None);

        let report = control.wait().await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Success);
        assert!(control.subscribe().await.is_none());
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_unreachable() {
        let h = harness(
            ScriptedTransport::new([Scripted::Fail(ReadError::connect("connection refused"))]),
            EngineConfig::default(),
        );

        let (collected, report) = h.engine.start(request("dave", true)).unwrap().collect().await;
        let report = report.unwrap();

        assert!(collected.head.is_none());
        assert!(matches!(
            collected.failure,
            Some(FailureReason::UpstreamUnreachable { .. })
        ));
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.raw_tokens, 0);
        assert!(!report.persisted);
        assert_eq!(h.sink.tasks()[0].raw_tokens, 0);
        assert_eq!(h.sink.tasks()[0].outcome, SessionOutcome::Failure);
    }

    #[tokio::test]
    async fn test_error_status_relayed_without_tokens() {
        let body = r#"{"error":{"message":"rate limited"}}"#;
        let h = harness(
            ScriptedTransport::new([Scripted::json(429, body)]),
            EngineConfig::default(),
        );

        let (collected, report) = h.engine.start(request("dave", false)).unwrap().collect().await;
        let report = report.unwrap();

        assert_eq!(collected.head.unwrap().status, 429);
        assert_eq!(collected.body.as_ref(), body.as_bytes());
        assert!(matches!(
            collected.failure,
            Some(FailureReason::ProtocolError {
                status: Some(429),
                ..
            })
        ));
        assert_eq!(report.upstream_status, Some(429));
        assert_eq!(report.raw_tokens, 0);
        assert!(!report.persisted);
        assert!(h.messages.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_fails_session_and_keeps_buffered_tokens() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig {
                session_deadline: Duration::from_millis(100),
                ..EngineConfig::default()
            },
        );
        let handle = h.engine.start(request("erin", true)).unwrap();
        tx.unbounded_send(Ok(delta_chunk(&"y".repeat(40)))).unwrap();

        let (collected, report) = handle.collect().await;
        let report = report.unwrap();

        assert_eq!(collected.failure, Some(FailureReason::Timeout));
        assert_eq!(report.failure, Some(FailureReason::Timeout));
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.raw_tokens, 10);
        assert_eq!(h.metrics.snapshot().sessions_timed_out, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_stalled_message_store_cannot_hold_session() {
        let sink = RecordingSink::new();
        let engine = SessionEngine::new(
            ScriptedTransport::new([Scripted::event_stream(fixed_body(vec![
                delta_chunk("hello world"),
                done_chunk(),
            ]))]),
            sink.clone(),
            Arc::new(StalledMessageStore),
            Arc::new(CharRatioEstimator::default()),
            EngineConfig {
                session_deadline: Duration::from_millis(100),
                persist_grace: Duration::from_millis(50),
                ..EngineConfig::default()
            },
            Arc::new(GatewayMetrics::new()),
        );
        let handle = engine.start(request("ivy", true)).unwrap();

        let (collected, report) = tokio::time::timeout(Duration::from_secs(2), handle.collect())
            .await
            .expect("session never reached a terminal state");
        let report = report.unwrap();

        assert!(collected.body.starts_with(b"data: "));
        assert_eq!(report.outcome, SessionOutcome::Success);
        assert_eq!(report.state, SessionState::Completed);
        assert!(!report.persisted);
        assert!(report.accounting_enqueued);

        let tasks = sink.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].raw_tokens, report.raw_tokens);
        assert!(report.raw_tokens > 0);

        assert!(engine.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_oversized_response_is_cut_off() {
        let (tx, body) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body)]),
            EngineConfig {
                max_response_bytes: 128,
                ..EngineConfig::default()
            },
        );
        let handle = h.engine.start(request("frank", true)).unwrap();
        tx.unbounded_send(Ok(delta_chunk(&"z".repeat(200)))).unwrap();

        let (collected, report) = handle.collect().await;
        let report = report.unwrap();

        assert!(collected.body.is_empty());
        match report.failure {
            Some(FailureReason::ProtocolError { message, .. }) => {
                assert!(message.contains("128 bytes"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(report.raw_tokens, 0);
    }
}

// =============================================================================
// Admission
// =============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn test_per_user_concurrency_cap() {
        let (tx, body) = body_channel();
        let (tx2, body2) = body_channel();
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(body), Scripted::event_stream(body2)]),
            EngineConfig {
                max_sessions_per_user: Some(1),
                ..EngineConfig::default()
            },
        );

        let first = h.engine.start(request("gina", true)).unwrap();
        let err = h.engine.start(request("gina", true)).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyLimit { limit: 1, .. }));
        assert_eq!(err.status_code(), 429);

        let other_user = h.engine.start(request("hank", true)).unwrap();
        assert_eq!(h.engine.active().total(), 2);

        drop(tx);
        drop(tx2);
        let (_, report) = first.collect().await;
        report.unwrap();
        assert_eq!(h.engine.active().count("gina"), 0);
        other_user.control().wait().await.unwrap();
        assert_eq!(h.engine.active().total(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let h = harness(
            ScriptedTransport::new([Scripted::event_stream(fixed_body(vec![done_chunk()]))]),
            EngineConfig::default(),
        );
        let handle = h.engine.start(request("ivy", true)).unwrap();
        let control = handle.control();
        drop(handle);

        assert!(h.engine.shutdown(Duration::from_secs(5)).await);
        assert!(control.report().is_some());
        assert!(matches!(
            h.engine.start(request("ivy", true)),
            Err(Error::ShuttingDown)
        ));
    }
}
