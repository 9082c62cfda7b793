//! reqwest-backed transport with one pooled client per provider.

use std::error::Error as StdError;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use secrecy::ExposeSecret;

use super::{ReadError, ReadErrorKind, UpstreamRequest, UpstreamResponse, UpstreamTransport};
use crate::config::RuntimeConfig;
use crate::models::{AuthScheme, ProviderEntry};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub tcp_keepalive: Option<Duration>,
    pub http2_keep_alive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 32,
            tcp_keepalive: Some(Duration::from_secs(60)),
            http2_keep_alive: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            connect_timeout: runtime.connect_timeout(),
            idle_timeout: runtime.pool_idle_timeout(),
            ..Self::default()
        }
    }

    fn apply_to_builder(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        builder = builder
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        if let Some(interval) = self.http2_keep_alive {
            builder = builder
                .http2_keep_alive_interval(interval)
                .http2_keep_alive_while_idle(true);
        }

        builder
    }
}

/// Long-lived clients keyed by provider name, built on first use.
///
/// No total request timeout is set: a streaming body may legitimately run for
/// minutes and the session deadline bounds it instead.
pub struct ReqwestTransport {
    clients: DashMap<String, reqwest::Client>,
    pool: PoolConfig,
}

impl ReqwestTransport {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            clients: DashMap::new(),
            pool,
        }
    }

    fn client_for(&self, provider: &ProviderEntry) -> Result<reqwest::Client, ReadError> {
        if let Some(client) = self.clients.get(&provider.name) {
            return Ok(client.clone());
        }
        let client = self
            .pool
            .apply_to_builder(reqwest::Client::builder())
            .build()
            .map_err(|e| ReadError::connect(format!("building client: {e}")))?;
        self.clients
            .entry(provider.name.clone())
            .or_insert_with(|| client.clone());
        Ok(client)
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[async_trait::async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ReadError> {
        let provider = &request.provider;
        let client = self.client_for(provider)?;
        let url = provider.endpoint(request.mode);

        let mut builder = client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(request.body);
        if request.stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }
        if let Some(secret) = &provider.credential {
            builder = match provider.kind.auth_scheme() {
                AuthScheme::Bearer => builder.bearer_auth(secret.expose_secret()),
                AuthScheme::XApiKey => builder
                    .header("x-api-key", secret.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
            };
        }

        tracing::debug!(provider = %provider.name, url = %url, stream = request.stream, "Dispatching upstream request");
        let response = builder.send().await.map_err(|e| classify_reqwest(&e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| classify_reqwest(&e)))
            .boxed();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Maps a reqwest error onto a transport error class by walking its source chain.
pub fn classify_reqwest(err: &reqwest::Error) -> ReadError {
    let message = err.to_string();
    if err.is_timeout() {
        return ReadError::timed_out(message);
    }
    if err.is_connect() {
        return ReadError::connect(message);
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            let kind = match io.kind() {
                std::io::ErrorKind::Interrupted => ReadErrorKind::Cancelled,
                std::io::ErrorKind::TimedOut => ReadErrorKind::TimedOut,
                _ => ReadErrorKind::Io,
            };
            return ReadError::new(kind, message);
        }
        if cause.to_string().to_lowercase().contains("cancel") {
            return ReadError::cancelled(message);
        }
        source = cause.source();
    }

    if err.is_body() || err.is_decode() {
        ReadError::protocol(message)
    } else if err.is_request() {
        ReadError::connect(message)
    } else {
        ReadError::new(ReadErrorKind::Io, message)
    }
}
