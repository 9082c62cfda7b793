//! One task per upstream call.
//!
//! The upstream request runs on a task owned by the engine, never by the
//! client. A client that goes away only loses its subscription; the session
//! keeps reading, persists what it got, and hands exactly one accounting task
//! to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use super::classify::{FailureCause, ReadContext, SuspensionPoint, classify};
use super::registry::{ActiveSessions, SessionGuard};
use super::state::{FailureReason, SessionOutcome, SessionReport, SessionState};
use super::subscriber::{Collected, Frame, ResponseHead, SubscriberSet, Subscription};
use super::usage::UsageTracker;
use crate::accounting::{AccountingSink, AccountingTask};
use crate::client::{BodyStream, ReadError, UpstreamRequest, UpstreamTransport};
use crate::config::RuntimeConfig;
use crate::models::ResolvedRoute;
use crate::observability::{GatewayMetrics, SessionSpan};
use crate::store::{MessageStore, StoredMessage};
use crate::tiers::{QuotaPool, Tier};
use crate::tokens::TokenEstimator;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_deadline: Duration,
    /// Floor on the time left to persist output once the upstream phase ends.
    pub persist_grace: Duration,
    pub max_response_bytes: usize,
    pub subscriber_buffer: usize,
    /// How long a full subscriber may hold up a chunk before it is detached.
    pub subscriber_patience: Duration,
    pub max_sessions_per_user: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_deadline: Duration::from_secs(600),
            persist_grace: Duration::from_secs(5),
            max_response_bytes: 32 * 1024 * 1024,
            subscriber_buffer: 256,
            subscriber_patience: Duration::from_millis(100),
            max_sessions_per_user: None,
        }
    }
}

impl EngineConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            session_deadline: runtime.session_deadline(),
            persist_grace: runtime.persist_grace(),
            max_response_bytes: runtime.max_response_bytes,
            subscriber_buffer: runtime.subscriber_buffer,
            subscriber_patience: runtime.subscriber_patience(),
            max_sessions_per_user: runtime.max_sessions_per_user,
        }
    }
}

/// A routed, quota-cleared call ready to be forwarded.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub tier: Tier,
    pub chat_id: Option<String>,
    pub endpoint: String,
    pub route: ResolvedRoute,
    /// Quota pool the usage is charged to.
    pub pool: QuotaPool,
    /// Body as sent upstream.
    pub body: Bytes,
    pub stream: bool,
}

enum Command {
    Subscribe(oneshot::Sender<Subscription>),
}

/// Cloneable control side of a running session.
#[derive(Clone)]
pub struct SessionControl {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    report: watch::Receiver<Option<SessionReport>>,
}

impl SessionControl {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attaches another subscriber. It first receives the response head and
    /// everything buffered so far as one frame, then live chunks.
    ///
    /// Returns `None` once the session has stopped reading.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Subscribe(tx)).await.ok()?;
        rx.await.ok()
    }

    /// The final report, if the session has already finished.
    pub fn report(&self) -> Option<SessionReport> {
        self.report.borrow().clone()
    }

    pub async fn wait(&self) -> Result<SessionReport> {
        let mut rx = self.report.clone();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ServiceUnavailable("session task ended without a report".into()))?;
        (*report)
            .clone()
            .ok_or_else(|| Error::ServiceUnavailable("session report missing".into()))
    }
}

/// What [`SessionEngine::start`] hands back: the client's subscription plus
/// the session's control handle.
pub struct SessionHandle {
    client: Subscription,
    control: SessionControl,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn client(&mut self) -> &mut Subscription {
        &mut self.client
    }

    pub fn into_parts(self) -> (Subscription, SessionControl) {
        (self.client, self.control)
    }

    /// Reads the whole response as the client, then waits for the report.
    pub async fn collect(self) -> (Collected, Result<SessionReport>) {
        let (client, control) = self.into_parts();
        let collected = client.collect().await;
        let report = control.wait().await;
        (collected, report)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.control.id)
            .finish_non_exhaustive()
    }
}

struct EngineShared {
    transport: Arc<dyn UpstreamTransport>,
    accounting: Arc<dyn AccountingSink>,
    messages: Arc<dyn MessageStore>,
    estimator: Arc<dyn TokenEstimator>,
    active: ActiveSessions,
    tracker: TaskTracker,
    config: EngineConfig,
    metrics: Arc<GatewayMetrics>,
}

#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<EngineShared>,
}

impl SessionEngine {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        accounting: Arc<dyn AccountingSink>,
        messages: Arc<dyn MessageStore>,
        estimator: Arc<dyn TokenEstimator>,
        config: EngineConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                transport,
                accounting,
                messages,
                estimator,
                active: ActiveSessions::new(config.max_sessions_per_user),
                tracker: TaskTracker::new(),
                config,
                metrics,
            }),
        }
    }

    pub fn active(&self) -> &ActiveSessions {
        &self.shared.active
    }

    pub fn in_flight(&self) -> usize {
        self.shared.tracker.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Spawns the session task and returns immediately.
    pub fn start(&self, request: SessionRequest) -> Result<SessionHandle> {
        if self.shared.tracker.is_closed() {
            return Err(Error::ShuttingDown);
        }
        let guard = self.shared.active.acquire(&request.user_id)?;

        let id = Uuid::new_v4();
        let span = SessionSpan::new(
            id,
            &request.user_id,
            &request.route.canonical_name,
            &request.route.provider.name,
        );
        let client_gone = CancellationToken::new();
        let mut subscribers = SubscriberSet::new(
            self.shared.config.subscriber_buffer,
            self.shared.config.subscriber_patience,
        );
        let client = subscribers.add(Vec::new(), Some(client_gone.clone().drop_guard()));

        let (command_tx, command_rx) = mpsc::channel(16);
        let (report_tx, report_rx) = watch::channel(None);
        let now = Instant::now();

        let session = StreamingSession {
            id,
            request,
            state: SessionState::Created,
            buffer: BytesMut::new(),
            subscribers,
            head: None,
            usage: UsageTracker::new(),
            deadline: now + self.shared.config.session_deadline,
            client_gone,
            span,
            shared: self.shared.clone(),
            _guard: guard,
        };

        self.shared.metrics.record_session_start();
        let instrument = session.span.span().clone();
        self.shared
            .tracker
            .spawn(session.run(command_rx, report_tx).instrument(instrument));

        Ok(SessionHandle {
            client,
            control: SessionControl {
                id,
                commands: command_tx,
                report: report_rx,
            },
        })
    }

    /// Stops admitting sessions and waits up to `grace` for running ones.
    ///
    /// Returns `true` when every session finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shared.tracker.close();
        let drained = tokio::time::timeout(grace, self.shared.tracker.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!("Session engine drained");
        } else {
            tracing::warn!(
                remaining = self.shared.tracker.len(),
                "Session engine shutdown grace period elapsed"
            );
        }
        drained
    }
}

enum Termination {
    /// Upstream end of stream, or the `[DONE]` marker.
    Natural,
    ClientCancelled,
    Failed(FailureReason),
}

struct StreamingSession {
    id: Uuid,
    request: SessionRequest,
    state: SessionState,
    buffer: BytesMut,
    subscribers: SubscriberSet,
    head: Option<ResponseHead>,
    usage: UsageTracker,
    deadline: Instant,
    client_gone: CancellationToken,
    span: SessionSpan,
    shared: Arc<EngineShared>,
    _guard: SessionGuard,
}

impl StreamingSession {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        report_tx: watch::Sender<Option<SessionReport>>,
    ) {
        let deadline = self.deadline;
        let id = self.id;
        let termination = tokio::select! {
            end = self.drive(&mut commands) => end,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(session_id = %id, "Session deadline reached");
                Termination::Failed(FailureReason::Timeout)
            }
        };
        commands.close();

        let report = self.finish(termination).await;
        report_tx.send_replace(Some(report));
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.span.transition(state);
    }

    async fn drive(&mut self, commands: &mut mpsc::Receiver<Command>) -> Termination {
        self.transition(SessionState::Forwarding);

        let transport = self.shared.transport.clone();
        let request = UpstreamRequest {
            provider: self.request.route.provider.clone(),
            mode: self.request.route.mode,
            body: self.request.body.clone(),
            stream: self.request.stream,
        };
        let send = transport.send(request);
        tokio::pin!(send);

        let response = loop {
            tokio::select! {
                result = &mut send => break result,
                Some(command) = commands.recv() => self.handle_command(command),
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return self.terminate_on_error(&err, SuspensionPoint::Connect),
        };

        let head = ResponseHead {
            status: response.status,
            content_type: response.content_type.clone(),
            streaming: response.is_success() && response.is_event_stream(),
        };
        tracing::debug!(session_id = %self.id, status = head.status, streaming = head.streaming, "Upstream responded");

        let mut body = response.body;
        if head.streaming {
            self.stream_body(head, &mut body, commands).await
        } else {
            self.buffer_body(head, &mut body, commands).await
        }
    }

    async fn stream_body(
        &mut self,
        head: ResponseHead,
        body: &mut BodyStream,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Termination {
        self.transition(SessionState::Streaming);
        self.subscribers.broadcast(&Frame::Head(head.clone())).await;
        self.head = Some(head);

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if let Err(overflow) = self.append(&chunk) {
                            return overflow;
                        }
                        self.usage.observe_chunk(&chunk);
                        self.subscribers.broadcast(&Frame::Data(chunk)).await;
                        if self.usage.stream_done() {
                            return Termination::Natural;
                        }
                    }
                    Some(Err(err)) => return self.terminate_on_error(&err, SuspensionPoint::BodyRead),
                    None => {
                        self.usage.finish_stream();
                        return Termination::Natural;
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }
    }

    /// Reads the whole body before any subscriber sees a byte.
    async fn buffer_body(
        &mut self,
        head: ResponseHead,
        body: &mut BodyStream,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Termination {
        self.transition(SessionState::Buffering);

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if let Err(overflow) = self.append(&chunk) {
                            return overflow;
                        }
                    }
                    Some(Err(err)) => return self.terminate_on_error(&err, SuspensionPoint::BodyRead),
                    None => break,
                },
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }

        let status = head.status;
        let success = (200..300).contains(&status);
        if success {
            self.usage.observe_body(&self.buffer);
        }

        self.subscribers.broadcast(&Frame::Head(head.clone())).await;
        self.head = Some(head);
        if !self.buffer.is_empty() {
            self.subscribers
                .broadcast(&Frame::Data(Bytes::copy_from_slice(&self.buffer)))
                .await;
        }

        if success {
            Termination::Natural
        } else {
            let snippet: String = String::from_utf8_lossy(&self.buffer).chars().take(256).collect();
            Termination::Failed(FailureReason::ProtocolError {
                status: Some(status),
                message: snippet,
            })
        }
    }

    fn append(&mut self, chunk: &[u8]) -> std::result::Result<(), Termination> {
        let limit = self.shared.config.max_response_bytes;
        if self.buffer.len() + chunk.len() > limit {
            tracing::warn!(session_id = %self.id, limit, "Upstream response exceeds size limit");
            return Err(Termination::Failed(FailureReason::ProtocolError {
                status: self.head.as_ref().map(|h| h.status),
                message: format!("response exceeded {limit} bytes"),
            }));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn terminate_on_error(&self, err: &ReadError, point: SuspensionPoint) -> Termination {
        let context = ReadContext {
            point,
            client_gone: self.client_gone.is_cancelled(),
            deadline_passed: Instant::now() >= self.deadline,
            bytes_received: self.buffer.len(),
        };
        let cause = classify(err, &context);
        tracing::debug!(
            session_id = %self.id,
            state = self.state.as_str(),
            cause = ?cause,
            error = %err,
            "Upstream read ended with an error"
        );

        match cause {
            FailureCause::ClientCancelled => Termination::ClientCancelled,
            FailureCause::Timeout => Termination::Failed(FailureReason::Timeout),
            FailureCause::Unreachable => Termination::Failed(FailureReason::UpstreamUnreachable {
                message: err.message.clone(),
            }),
            FailureCause::ProtocolError => Termination::Failed(FailureReason::ProtocolError {
                status: self.head.as_ref().map(|h| h.status),
                message: err.message.clone(),
            }),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(reply) => {
                let mut prefix = Vec::new();
                if let Some(head) = &self.head {
                    prefix.push(Frame::Head(head.clone()));
                    if !self.buffer.is_empty() {
                        prefix.push(Frame::Data(Bytes::copy_from_slice(&self.buffer)));
                    }
                }
                let subscription = self.subscribers.add(prefix, None);
                tracing::debug!(
                    session_id = %self.id,
                    subscriber = subscription.id(),
                    subscribers = self.subscribers.len(),
                    "Subscriber attached"
                );
                let _ = reply.send(subscription);
            }
        }
    }

    async fn finish(mut self, termination: Termination) -> SessionReport {
        self.transition(SessionState::Completing);

        let (outcome, failure) = match termination {
            Termination::Natural => (SessionOutcome::Success, None),
            Termination::ClientCancelled => (SessionOutcome::PartialSuccess, None),
            Termination::Failed(reason) => (SessionOutcome::Failure, Some(reason)),
        };

        if let Some(reason) = &failure {
            self.subscribers.broadcast(&Frame::Failed(reason.clone())).await;
        }
        self.subscribers.close();

        let status = self.head.as_ref().map(|h| h.status);
        let success = status.is_some_and(|s| (200..300).contains(&s));
        if self.head.as_ref().is_some_and(|h| h.streaming) {
            self.usage.finish_stream();
        }

        let content = (success && !self.buffer.is_empty()).then(|| self.usage.content(&self.buffer));
        let reported = self.usage.reported_tokens();
        let raw_tokens = match (&content, reported) {
            (None, _) => 0,
            (Some(_), Some(tokens)) => tokens,
            (Some(text), None) => self.shared.estimator.estimate(text),
        };

        let route = &self.request.route;
        let task = AccountingTask {
            session_id: self.id,
            user_id: self.request.user_id.clone(),
            tier: self.request.tier.clone(),
            endpoint: self.request.endpoint.clone(),
            canonical_model: route.canonical_name.clone(),
            provider: route.provider.name.clone(),
            multiplier: route.multiplier,
            raw_tokens,
            outcome,
            pool: self.request.pool,
            finished_at: Utc::now(),
        };
        let accounting_enqueued = self.shared.accounting.submit(task).is_enqueued();

        let persisted = match content {
            Some(content) => self.persist(content, raw_tokens).await,
            None => false,
        };

        let state = outcome.terminal_state();
        self.transition(state);
        let duration_ms = self.span.finish(outcome, raw_tokens);
        self.shared
            .metrics
            .record_session_end(outcome, failure.as_ref(), raw_tokens, duration_ms as f64);

        match &failure {
            Some(reason) => tracing::warn!(
                session_id = %self.id,
                outcome = outcome.as_str(),
                failure = %reason,
                raw_tokens,
                duration_ms,
                "Session failed"
            ),
            None => tracing::info!(
                session_id = %self.id,
                outcome = outcome.as_str(),
                raw_tokens,
                bytes = self.buffer.len(),
                duration_ms,
                "Session completed"
            ),
        }

        SessionReport {
            session_id: self.id,
            state,
            outcome,
            failure,
            upstream_status: status,
            bytes: self.buffer.len(),
            raw_tokens,
            usage_reported: success && reported.is_some(),
            persisted,
            accounting_enqueued,
            duration_ms,
        }
    }

    /// Saves the assistant output, giving up at the session deadline or after
    /// `persist_grace`, whichever is later.
    async fn persist(&self, content: String, raw_tokens: u64) -> bool {
        let message = StoredMessage {
            session_id: self.id,
            user_id: self.request.user_id.clone(),
            chat_id: self.request.chat_id.clone(),
            role: "assistant".to_string(),
            content,
            raw_tokens,
            created_at: Utc::now(),
        };
        let until = self
            .deadline
            .max(Instant::now() + self.shared.config.persist_grace);
        match tokio::time::timeout_at(until, self.shared.messages.save(&message)).await {
            Ok(Ok(())) => true,
            Err(_) => {
                tracing::error!(
                    session_id = %self.id,
                    store = self.shared.messages.name(),
                    "Timed out persisting session output"
                );
                false
            }
            Ok(Err(e)) => {
                tracing::error!(
                    session_id = %self.id,
                    store = self.shared.messages.name(),
                    error = %e,
                    "Failed to persist session output"
                );
                false
            }
        }
    }
}
