//! Spillway - a tiered, resource-aware routing proxy for pools of LLM inference servers
//!
//! Callers address *virtual* models. Each virtual model is served by one or more backend servers
//! grouped into priority tiers; a request is tried against every server, most preferred first,
//! until one that is healthy and has room for the model answers successfully.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

pub mod adapter;
pub mod admin;
pub mod client;
pub mod dispatch;
pub mod errors;
pub mod framing;
pub mod handlers;
pub mod health;
pub mod models;
pub mod ranking;
pub mod registry;
pub mod resource;

use client::{HttpClient, HyperClient, PoolSettings};
use dispatch::{DispatchSettings, Dispatcher};
use registry::ServerRegistry;

/// The main application state: the dispatcher and everything it owns.
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub dispatcher: Arc<Dispatcher<T>>,
    pub started_at: Instant,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        settings: DispatchSettings,
        pool: PoolSettings,
    ) -> Self {
        let http_client = client::create_hyper_client(pool);
        Self::with_client(registry, http_client, settings)
    }
}

impl<T: HttpClient + Clone + Send + Sync> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(
        registry: Arc<dyn ServerRegistry>,
        http_client: T,
        settings: DispatchSettings,
    ) -> Self {
        Self::from_dispatcher(Dispatcher::new(registry, http_client, settings))
    }

    pub fn from_dispatcher(dispatcher: Dispatcher<T>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            started_at: Instant::now(),
        }
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/api/*` - the native surface; `/api/tags` is answered locally
/// - `/v1/models`, `/v1/chat/completions` - the OpenAI-compatible surface
/// - `/health`, `/status`, `/config/*`, `/admin/*` - operational endpoints
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/generate", post(handlers::generate))
        .route("/api/embeddings", post(handlers::embeddings))
        .route("/api/show", post(handlers::show))
        .route("/api/tags", get(handlers::tags))
        .route("/v1/models", get(handlers::models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .merge(admin::router())
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` accepts either a string literal or an owned string; it must live for the whole
/// program, as the Prometheus layer requires.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// Programmable stand-ins for backends and resource monitors, shared by unit and integration
/// tests.
#[doc(hidden)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::StatusCode;
    use client::BoxError;
    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use std::sync::{Mutex, PoisonError};

    pub use crate::resource::ManualClock;

    /// What the mock answers with.
    #[derive(Debug, Clone)]
    pub enum MockResponse {
        Buffered {
            status: StatusCode,
            content_type: &'static str,
            body: String,
        },
        /// A chunked body; an `Err` item breaks the stream at that point.
        Stream(StatusCode, Vec<Result<String, String>>),
        /// Sends these chunks, then keeps the connection open without sending anything else.
        Stall(StatusCode, Vec<String>),
        TransportError(String),
        /// Never answers.
        Hang,
    }

    impl MockResponse {
        pub fn json(status: StatusCode, body: Value) -> Self {
            MockResponse::Buffered {
                status,
                content_type: "application/json",
                body: body.to_string(),
            }
        }

        pub fn text(status: StatusCode, body: &str) -> Self {
            MockResponse::Buffered {
                status,
                content_type: "text/plain",
                body: body.to_owned(),
            }
        }
    }

    /// A resource monitor's `/resource-check` answer.
    pub fn monitor_reply(sufficient: bool, available_gb: f64, total_gb: f64, usage_percent: f64) -> MockResponse {
        MockResponse::json(
            StatusCode::OK,
            json!({
                "status": "success",
                "data": {
                    "sufficient": sufficient,
                    "available_gb": available_gb,
                    "total_gb": total_gb,
                    "usage_percent": usage_percent,
                }
            }),
        )
    }

    type Handler = dyn Fn(&MockRequest) -> MockResponse + Send + Sync;

    #[derive(Clone)]
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        handler: Arc<Handler>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockRequest {
        fn parsed_uri(&self) -> Option<axum::http::Uri> {
            self.uri.parse().ok()
        }

        pub fn host(&self) -> String {
            self.parsed_uri()
                .and_then(|u| u.host().map(str::to_owned))
                .unwrap_or_default()
        }

        pub fn path(&self) -> String {
            self.parsed_uri()
                .map(|u| u.path().to_owned())
                .unwrap_or_default()
        }

        pub fn header(&self, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        pub fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap_or(Value::Null)
        }
    }

    impl MockHttpClient {
        /// Answer every request with the same status and body.
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_owned();
            Self::with_handler(move |_| MockResponse::Buffered {
                status,
                content_type: "application/json",
                body: body.clone(),
            })
        }

        pub fn with_handler(handler: impl Fn(&MockRequest) -> MockResponse + Send + Sync + 'static) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                handler: Arc::new(handler),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("handler", &"<closure>")
                .finish()
        }
    }

    fn build(status: StatusCode, content_type: &str, body: Body) -> Result<axum::response::Response, BoxError> {
        axum::response::Response::builder()
            .status(status)
            .header("content-type", content_type)
            .body(body)
            .map_err(|e| Box::new(e) as BoxError)
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(&self, req: axum::extract::Request) -> Result<axum::response::Response, BoxError> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .to_vec();

            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            let response = (self.handler)(&mock_request);
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(mock_request);

            match response {
                MockResponse::Buffered {
                    status,
                    content_type,
                    body,
                } => build(status, content_type, Body::from(body)),
                MockResponse::Stream(status, chunks) => {
                    let stream = futures_util::stream::iter(chunks.into_iter().map(|chunk| {
                        chunk.map(Bytes::from).map_err(std::io::Error::other)
                    }));
                    build(status, "application/x-ndjson", Body::from_stream(stream))
                }
                MockResponse::Stall(status, chunks) => {
                    let stream = futures_util::stream::iter(
                        chunks
                            .into_iter()
                            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk))),
                    )
                    .chain(futures_util::stream::pending());
                    build(status, "application/x-ndjson", Body::from_stream(stream))
                }
                MockResponse::TransportError(message) => Err(message.into()),
                MockResponse::Hang => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FileRegistry, ServerRecord};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::json;
    use test_utils::MockHttpClient;

    fn record(id: u64, model: &str, host: &str) -> ServerRecord {
        ServerRecord::builder()
            .id(id)
            .virtual_model_name(model)
            .server_url(format!("http://{host}:11434").parse().unwrap())
            .actual_model_name(format!("{model}:14b"))
            .skip_resource_check(true)
            .build()
    }

    fn server_with(records: Vec<ServerRecord>, client: MockHttpClient) -> TestServer {
        let registry = Arc::new(FileRegistry::from_records(records).unwrap());
        let app_state = AppState::with_client(registry, client, DispatchSettings::default());
        TestServer::new(build_router(app_state)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_model_is_service_unavailable() {
        let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server_with(vec![], mock_client.clone());

        let response = server
            .post("/api/chat")
            .json(&json!({"model": "qwen3", "messages": []}))
            .await;

        assert_eq!(response.status_code(), 503);
        assert_eq!(response.json::<serde_json::Value>()["error"]["type"], "configuration_error");
        assert!(mock_client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_models_endpoint_lists_virtual_models_only() {
        let server = server_with(
            vec![record(1, "qwen3", "a"), record(2, "qwen3", "b"), record(3, "llama3", "c")],
            MockHttpClient::new(StatusCode::OK, "{}"),
        );

        let response = server.get("/v1/models").await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["qwen3", "llama3"]);
        assert_eq!(body["data"][0]["owned_by"], "spillway");
    }

    #[tokio::test]
    async fn test_tags_answered_locally() {
        let mock_client = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server_with(vec![record(1, "qwen3", "a")], mock_client.clone());

        let response = server.get("/api/tags").await;
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = response.json();
        assert_eq!(body["models"][0]["name"], "qwen3");
        assert_eq!(body["models"][0]["size"], 0);
        assert_eq!(body["models"][0]["digest"], "virtual-model");
        assert!(mock_client.get_requests().is_empty());
    }

    mod metrics {
        use super::*;
        use rstest::*;

        /// Fixture to create a shared metrics server and main server.
        /// axum-prometheus uses a global Prometheus registry, so only one metrics layer can be
        /// built per process and every metrics test shares it.
        #[fixture]
        #[once]
        fn get_shared_metrics_servers() -> (TestServer, TestServer) {
            let (prometheus_layer, handle) = build_metrics_layer_and_handle("spillway");

            let metrics_router = build_metrics_router(handle);
            let metrics_server = TestServer::new(metrics_router).unwrap();

            let registry = Arc::new(
                FileRegistry::from_records(vec![record(1, "qwen3", "a")]).unwrap(),
            );
            let app_state = AppState::with_client(
                registry,
                MockHttpClient::new(StatusCode::OK, "{}"),
                DispatchSettings::default(),
            );
            let router = build_router(app_state).layer(prometheus_layer);
            let server = TestServer::new(router).unwrap();

            (server, metrics_server)
        }

        fn request_count(metrics_text: &str, series: &str) -> i32 {
            metrics_text
                .lines()
                .find(|line| line.contains(series))
                .and_then(|line| line.split_whitespace().last())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_server_counts_v1_models(
            get_shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = get_shared_metrics_servers;
            let series = "spillway_http_requests_total{method=\"GET\",status=\"200\",endpoint=\"/v1/models\"}";

            let initial_count = request_count(&metrics_server.get("/metrics").await.text(), series);

            for _ in 0..11 {
                let response = server.get("/v1/models").await;
                assert_eq!(response.status_code(), 200);
            }

            let response = metrics_server.get("/metrics").await;
            assert_eq!(response.status_code(), 200);
            assert_eq!(
                request_count(&response.text(), series),
                initial_count + 11,
                "Metrics should increment by 11 total"
            );
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_server_counts_rejected_requests(
            get_shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = get_shared_metrics_servers;
            let series = "spillway_http_requests_total{method=\"POST\",status=\"400\",endpoint=\"/api/chat\"}";

            let initial_count = request_count(&metrics_server.get("/metrics").await.text(), series);

            let response = server.post("/api/chat").json(&json!({"messages": []})).await;
            assert_eq!(response.status_code(), 400);

            let response = metrics_server.get("/metrics").await;
            assert_eq!(
                request_count(&response.text(), series),
                initial_count + 1,
                "Metrics should increment by 1"
            );
        }
    }
}
