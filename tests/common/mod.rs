//! Shared fixtures: a scripted upstream, a recording accounting sink, and
//! builders for routes and SSE chunks.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use inference_proxy::accounting::{AccountingSink, AccountingTask, EnqueueOutcome};
use inference_proxy::client::{BodyStream, ReadError, UpstreamRequest, UpstreamResponse, UpstreamTransport};
use inference_proxy::models::{ApiMode, ProviderEntry, ProviderKind, ResolvedRoute};
use inference_proxy::quota::Multiplier;
use inference_proxy::store::{MessageStore, StoreResult, StoredMessage};
use serde_json::json;
use url::Url;

pub type BodySender = mpsc::UnboundedSender<Result<Bytes, ReadError>>;

pub enum Scripted {
    Respond {
        status: u16,
        content_type: &'static str,
        body: BodyStream,
    },
    Fail(ReadError),
}

impl Scripted {
    pub fn event_stream(body: BodyStream) -> Self {
        Self::Respond {
            status: 200,
            content_type: "text/event-stream",
            body,
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            content_type: "application/json",
            body: fixed_body(vec![Bytes::from(body.to_string())]),
        }
    }
}

/// Answers each `send` with the next scripted response, in order.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ReadError> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Respond {
                status,
                content_type,
                body,
            }) => Ok(UpstreamResponse {
                status,
                content_type: Some(content_type.to_string()),
                body,
            }),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(ReadError::connect("no scripted response left")),
        }
    }
}

/// Keeps every submitted task.
#[derive(Default)]
pub struct RecordingSink {
    tasks: Mutex<Vec<AccountingTask>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tasks(&self) -> Vec<AccountingTask> {
        self.tasks.lock().unwrap().clone()
    }
}

impl AccountingSink for RecordingSink {
    fn submit(&self, task: AccountingTask) -> EnqueueOutcome {
        self.tasks.lock().unwrap().push(task);
        EnqueueOutcome::Enqueued
    }
}

/// A body whose chunks the test pushes one at a time. Dropping the sender
/// ends the stream.
pub fn body_channel() -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::unbounded();
    (tx, rx.boxed())
}

pub fn fixed_body(chunks: Vec<Bytes>) -> BodyStream {
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// One chat-completions delta event.
pub fn delta_chunk(content: &str) -> Bytes {
    let event = json!({"choices": [{"index": 0, "delta": {"content": content}}]});
    Bytes::from(format!("data: {event}\n\n"))
}

pub fn usage_chunk(prompt: u64, completion: u64) -> Bytes {
    let event = json!({
        "choices": [],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        }
    });
    Bytes::from(format!("data: {event}\n\n"))
}

pub fn done_chunk() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

pub fn provider(name: &str, kind: ProviderKind, base_url: &str) -> ProviderEntry {
    ProviderEntry::new(name, kind, Url::parse(base_url).unwrap()).with_credential("sk-test")
}

pub fn route(canonical: &str, multiplier: rust_decimal::Decimal) -> ResolvedRoute {
    ResolvedRoute {
        canonical_name: canonical.to_string(),
        upstream_model: canonical.to_string(),
        provider: Arc::new(provider("openai", ProviderKind::OpenAi, "https://api.openai.com/v1/")),
        multiplier: Multiplier::new(multiplier).unwrap(),
        mode: ApiMode::Standard,
    }
}

/// Message store whose writes never complete.
#[derive(Debug, Default)]
pub struct StalledMessageStore;

#[async_trait::async_trait]
impl MessageStore for StalledMessageStore {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn save(&self, _message: &StoredMessage) -> StoreResult<()> {
        std::future::pending().await
    }
}
