//! Exhaustive, tiered dispatch of one request across every server of a virtual model
//!
//! Candidates are walked strictly in [`Ranking::full_order`]. Each one must pass a health probe
//! and, unless the record opts out, a resource check before the request is forwarded. Any
//! failure, including a 4xx from the backend, moves on to the next candidate; only when every
//! candidate has failed does the caller see an error.
use crate::adapter;
use crate::client::{BoxError, HttpClient};
use crate::errors::{CandidateFailure, DispatchError};
use crate::health::HealthProber;
use crate::ranking::Ranking;
use crate::registry::{ServerRecord, ServerRegistry, UsageRecorder};
use crate::resource::{Clock, GateSettings, ResourceGate, SystemClock};
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header},
};
use bon::Builder;
use futures_util::{Stream, StreamExt, stream::BoxStream};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Headers that describe the caller's connection rather than the request.
const HOP_BY_HOP: [header::HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    header::HOST,
];

/// How much of a failed backend's body is kept for the error message.
const ERROR_DETAIL_LIMIT: usize = 512;

#[derive(Debug, Clone, Builder)]
pub struct DispatchSettings {
    #[builder(default = Duration::from_secs(3))]
    pub health_check_timeout: Duration,
    /// Bounds a whole buffered exchange, or a streaming one up to its status line.
    #[builder(default = Duration::from_secs(300))]
    pub request_timeout: Duration,
    /// Longest gap allowed between two chunks of an opened stream.
    #[builder(default = Duration::from_secs(300))]
    pub stream_idle_timeout: Duration,
    #[builder(default)]
    pub gate: GateSettings,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A caller's request, addressed to a virtual model.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: Method,
    /// Backend path, e.g. `/api/chat`.
    pub path: String,
    pub virtual_model: String,
    pub headers: HeaderMap,
    pub body: Value,
}

impl DispatchRequest {
    pub fn post(path: impl Into<String>, virtual_model: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            virtual_model: virtual_model.into(),
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A successful buffered exchange, with the model name already restored.
#[derive(Debug, Clone)]
pub struct BufferedReply {
    pub status: StatusCode,
    pub body: Value,
    pub server: ServerRecord,
}

/// The body of an opened stream. A stall longer than the idle timeout surfaces as an error item.
pub type UpstreamBody = BoxStream<'static, Result<Bytes, BoxError>>;

/// A stream whose status line has been accepted. From here on there is no fallback.
pub struct OpenedStream {
    pub server: ServerRecord,
    pub status: StatusCode,
    pub body: UpstreamBody,
    pub request_id: String,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("server", &self.server.server_url)
            .field("status", &self.status)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Bound every wait for the next chunk by `idle`.
pub(crate) fn idle_bounded<S, E>(body: S, idle: Duration) -> UpstreamBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError>,
{
    tokio_stream::StreamExt::timeout(body, idle)
        .map(move |item| match item {
            Ok(chunk) => chunk.map_err(Into::into),
            Err(_) => Err(format!("backend sent nothing for {}ms", idle.as_millis()).into()),
        })
        .boxed()
}

#[derive(Debug)]
pub struct Dispatcher<T: HttpClient> {
    registry: Arc<dyn ServerRegistry>,
    prober: HealthProber<T>,
    gate: ResourceGate<T>,
    http_client: T,
    usage: UsageRecorder,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn transport(server: &ServerRecord, detail: impl ToString) -> CandidateFailure {
    CandidateFailure::BackendTransport {
        server_url: server.server_url.to_string(),
        detail: detail.to_string(),
    }
}

impl<T: HttpClient + Clone + Send + Sync> Dispatcher<T> {
    /// Must be called from within a tokio runtime, since it starts the usage recorder.
    pub fn new(registry: Arc<dyn ServerRegistry>, http_client: T, settings: DispatchSettings) -> Self {
        Self::with_clock(registry, http_client, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<dyn ServerRegistry>,
        http_client: T,
        settings: DispatchSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            usage: UsageRecorder::spawn(registry.clone()),
            registry,
            prober: HealthProber::new(http_client.clone(), settings.health_check_timeout),
            gate: ResourceGate::new(http_client.clone(), settings.gate, clock),
            http_client,
            request_timeout: settings.request_timeout,
            stream_idle_timeout: settings.stream_idle_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<dyn ServerRegistry> {
        &self.registry
    }

    pub fn prober(&self) -> &HealthProber<T> {
        &self.prober
    }

    pub fn gate(&self) -> &ResourceGate<T> {
        &self.gate
    }

    /// Every active server of `virtual_model` in retry order.
    pub async fn candidates(&self, virtual_model: &str) -> Result<Vec<ServerRecord>, DispatchError> {
        let servers = self.registry.active_servers(Some(virtual_model)).await?;
        let order = Ranking::new(servers).full_order();
        if order.is_empty() {
            return Err(DispatchError::NoServersConfigured {
                model: virtual_model.to_owned(),
            });
        }
        Ok(order)
    }

    /// Health, then resources. Passing both means the candidate may be forwarded to.
    pub async fn admit(&self, server: &ServerRecord, virtual_model: &str) -> Result<(), CandidateFailure> {
        let health = self
            .prober
            .probe(&server.server_url, &server.actual_model_name)
            .await;
        if !health.healthy {
            return Err(CandidateFailure::Unhealthy {
                server_url: health.server_url,
                detail: health.error.unwrap_or_else(|| "unhealthy".into()),
            });
        }

        if server.skip_resource_check {
            debug!(server_url = %server.server_url, "Resource check disabled for this server");
            return Ok(());
        }

        let outcome = self
            .gate
            .check_sufficiency(
                &server.server_url,
                server.server_type,
                server.performance_gb,
                Some(virtual_model),
            )
            .await;
        if outcome.sufficient {
            return Ok(());
        }
        Err(match outcome.error {
            Some(detail) => CandidateFailure::ResourceCheckTransport {
                server_url: server.server_url.to_string(),
                detail,
            },
            None => CandidateFailure::ResourceInsufficient {
                server_url: server.server_url.to_string(),
                server_type: server.server_type,
                required_gb: server.performance_gb,
                available_gb: outcome.available_gb,
                total_gb: outcome.total_gb,
                usage_percentage: outcome.usage_percentage,
            },
        })
    }

    fn upstream_request(
        &self,
        server: &ServerRecord,
        request: &DispatchRequest,
    ) -> Result<Request<Body>, CandidateFailure> {
        let mut body = request.body.clone();
        adapter::rewrite_request_model(&mut body, &request.virtual_model, &server.actual_model_name);
        let body = serde_json::to_vec(&body)
            .map_err(|e| CandidateFailure::NonRetriable(format!("unserializable body: {e}")))?;

        let uri = format!(
            "{}{}",
            server.server_url.as_str().trim_end_matches('/'),
            request.path
        );
        let uri = Uri::try_from(&uri).map_err(|e| transport(server, format!("invalid uri {uri}: {e}")))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in request.headers.iter() {
                if !HOP_BY_HOP.contains(name) {
                    headers.append(name, value.clone());
                }
            }
            if let Some(authority) = uri.authority()
                && let Ok(host) = HeaderValue::from_str(authority.as_str())
            {
                headers.insert(header::HOST, host);
            }
            headers
                .entry(header::CONTENT_TYPE)
                .or_insert(HeaderValue::from_static("application/json"));
        }
        builder
            .body(Body::from(body))
            .map_err(|e| transport(server, format!("failed to build request: {e}")))
    }

    fn failed_status(server: &ServerRecord, status: StatusCode, body: Bytes) -> CandidateFailure {
        let text = String::from_utf8_lossy(&body);
        let detail = match status {
            StatusCode::NOT_FOUND => "model or endpoint not found".to_owned(),
            s if s.is_server_error() => "backend error".to_owned(),
            _ => text.chars().take(ERROR_DETAIL_LIMIT).collect(),
        };
        CandidateFailure::BackendStatus {
            server_url: server.server_url.to_string(),
            status,
            detail,
        }
    }

    async fn try_buffered(
        &self,
        server: &ServerRecord,
        request: &DispatchRequest,
    ) -> Result<BufferedReply, CandidateFailure> {
        self.admit(server, &request.virtual_model).await?;
        let upstream = self.upstream_request(server, request)?;

        let started = Instant::now();
        let exchange = async {
            let response = self
                .http_client
                .request(upstream)
                .await
                .map_err(|e| transport(server, e))?;
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .map_err(|e| transport(server, format!("failed to read body: {e}")))?;
            Ok::<_, CandidateFailure>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                transport(
                    server,
                    format!("timed out after {}s", self.request_timeout.as_secs()),
                )
            })??;

        if status.is_client_error() || status.is_server_error() {
            return Err(Self::failed_status(server, status, bytes));
        }

        info!(
            server_url = %server.server_url,
            actual_model = %server.actual_model_name,
            status = status.as_u16(),
            elapsed = started.elapsed().as_secs_f64(),
            "Forwarded {} {}", request.method, request.path
        );

        let mut body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| json!({ "response": String::from_utf8_lossy(&bytes) }));
        adapter::restore_response_model(&mut body, &request.virtual_model, &server.actual_model_name);
        Ok(BufferedReply {
            status,
            body,
            server: server.clone(),
        })
    }

    async fn try_stream(
        &self,
        server: &ServerRecord,
        request: &DispatchRequest,
        request_id: &str,
    ) -> Result<OpenedStream, CandidateFailure> {
        self.admit(server, &request.virtual_model).await?;
        let upstream = self.upstream_request(server, request)?;

        let response = tokio::time::timeout(self.request_timeout, self.http_client.request(upstream))
            .await
            .map_err(|_| {
                transport(
                    server,
                    format!("no response within {}s", self.request_timeout.as_secs()),
                )
            })?
            .map_err(|e| transport(server, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = tokio::time::timeout(
                Duration::from_secs(1),
                axum::body::to_bytes(response.into_body(), ERROR_DETAIL_LIMIT * 8),
            )
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
            return Err(Self::failed_status(server, status, body));
        }

        Ok(OpenedStream {
            server: server.clone(),
            status,
            body: idle_bounded(response.into_body().into_data_stream(), self.stream_idle_timeout),
            request_id: request_id.to_owned(),
        })
    }

    /// Buffered dispatch: the whole backend reply is read before anything reaches the caller.
    #[instrument(skip(self, request), fields(model = %request.virtual_model, path = %request.path))]
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<BufferedReply, DispatchError> {
        let request_id = new_request_id();
        let candidates = self.candidates(&request.virtual_model).await?;
        let total = candidates.len();
        info!(request_id = %request_id, total, "Dispatching to {} candidates", total);

        let mut last_error = None;
        for (idx, server) in candidates.iter().enumerate() {
            let attempt = idx + 1;
            info!(
                request_id = %request_id,
                attempt,
                total,
                server_url = %server.server_url,
                actual_model = %server.actual_model_name,
                priority = server.priority,
                weight = server.weight,
                "Trying candidate"
            );
            match self.try_buffered(server, &request).await {
                Ok(reply) => {
                    self.usage.record(server.id);
                    return Ok(reply);
                }
                Err(failure) => {
                    failure.log(&request_id, attempt, total);
                    if !failure.is_retriable() {
                        return Err(DispatchError::NonRetriable(failure));
                    }
                    last_error = Some(failure);
                }
            }
        }
        Err(self.exhausted(&request.virtual_model, &request_id, total, last_error))
    }

    /// Streaming dispatch: candidates are walked until one answers with an acceptable status. The
    /// returned body has not been read yet.
    #[instrument(skip(self, request), fields(model = %request.virtual_model, path = %request.path))]
    pub async fn dispatch_stream(&self, request: DispatchRequest) -> Result<OpenedStream, DispatchError> {
        let request_id = new_request_id();
        let candidates = self.candidates(&request.virtual_model).await?;
        let total = candidates.len();
        info!(request_id = %request_id, total, "Opening stream, {} candidates", total);

        let mut last_error = None;
        for (idx, server) in candidates.iter().enumerate() {
            let attempt = idx + 1;
            info!(
                request_id = %request_id,
                attempt,
                total,
                server_url = %server.server_url,
                actual_model = %server.actual_model_name,
                priority = server.priority,
                weight = server.weight,
                "Trying candidate for stream"
            );
            match self.try_stream(server, &request, &request_id).await {
                Ok(opened) => {
                    info!(request_id = %request_id, server_url = %server.server_url, "Stream opened");
                    self.usage.record(server.id);
                    return Ok(opened);
                }
                Err(failure) => {
                    failure.log(&request_id, attempt, total);
                    if !failure.is_retriable() {
                        return Err(DispatchError::NonRetriable(failure));
                    }
                    last_error = Some(failure);
                }
            }
        }
        Err(self.exhausted(&request.virtual_model, &request_id, total, last_error))
    }

    fn exhausted(
        &self,
        model: &str,
        request_id: &str,
        attempts: usize,
        last_error: Option<CandidateFailure>,
    ) -> DispatchError {
        match last_error {
            Some(last_error) => {
                warn!(request_id, attempts, "All candidates for {} failed: {}", model, last_error);
                DispatchError::Exhausted {
                    model: model.to_owned(),
                    attempts,
                    last_error,
                }
            }
            None => DispatchError::NoServersConfigured {
                model: model.to_owned(),
            },
        }
    }
}
