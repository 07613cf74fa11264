/// Axum handlers for the native and OpenAI-compatible proxy surfaces
use crate::AppState;
use crate::adapter;
use crate::client::HttpClient;
use crate::dispatch::DispatchRequest;
use crate::errors::DispatchError;
use crate::models::{ChatCompletionRequest, ListModelResponse, OpenAiError, TagsResponse};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{Stream, StreamExt, future, stream};
use serde_json::Value;
use std::convert::Infallible;
use tracing::{debug, info, instrument, warn};

const NDJSON: &str = "application/x-ndjson";

/// How a native endpoint is forwarded.
struct NativeRoute {
    path: &'static str,
    /// Fields that may name the model, in order of preference.
    model_fields: &'static [&'static str],
    /// Whether `"stream": true` is honoured.
    streams: bool,
}

const CHAT: NativeRoute = NativeRoute {
    path: "/api/chat",
    model_fields: &["model"],
    streams: true,
};
const GENERATE: NativeRoute = NativeRoute {
    path: "/api/generate",
    model_fields: &["model"],
    streams: true,
};
const EMBEDDINGS: NativeRoute = NativeRoute {
    path: "/api/embeddings",
    model_fields: &["model"],
    streams: false,
};
const SHOW: NativeRoute = NativeRoute {
    path: "/api/show",
    model_fields: &["name", "model"],
    streams: false,
};

fn parse_object(body: &[u8]) -> Result<Value, DispatchError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        _ => Err(DispatchError::InvalidRequest(
            "request body must be a JSON object".into(),
        )),
    }
}

fn model_from(body: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        body.get(*field)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
    })
}

fn ndjson_response<S>(status: StatusCode, lines: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        status,
        [(header::CONTENT_TYPE, NDJSON), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(events),
    )
        .into_response()
}

async fn forward_native<T: HttpClient + Clone + Send + Sync>(
    state: &AppState<T>,
    route: &NativeRoute,
    headers: HeaderMap,
    body: &[u8],
) -> Result<Response, DispatchError> {
    let mut body = parse_object(body)?;
    let model = model_from(&body, route.model_fields).ok_or_else(|| {
        DispatchError::InvalidRequest(format!(
            "missing required field: {}",
            route.model_fields.join(" or ")
        ))
    })?;
    let streaming = route.streams && body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if route.streams && !streaming {
        // Native backends stream unless told otherwise.
        body["stream"] = Value::Bool(false);
    }
    info!("Received {} request for model: {}", route.path, model);

    let request = DispatchRequest::post(route.path, &model, body).with_headers(headers);
    if streaming {
        let opened = state.dispatcher.dispatch_stream(request).await?;
        let status = opened.status;
        return Ok(ndjson_response(status, adapter::native_stream(opened, model)));
    }

    let reply = state.dispatcher.dispatch(request).await?;
    Ok((reply.status, Json(reply.body)).into_response())
}

#[instrument(skip(state, headers, body))]
pub async fn chat<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    forward_native(&state, &CHAT, headers, &body).await
}

#[instrument(skip(state, headers, body))]
pub async fn generate<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    forward_native(&state, &GENERATE, headers, &body).await
}

#[instrument(skip(state, headers, body))]
pub async fn embeddings<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    forward_native(&state, &EMBEDDINGS, headers, &body).await
}

#[instrument(skip(state, headers, body))]
pub async fn show<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    forward_native(&state, &SHOW, headers, &body).await
}

#[instrument(skip(state))]
pub async fn tags<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<TagsResponse>, DispatchError> {
    let names = state.dispatcher.registry().virtual_models().await?;
    debug!("Listing {} virtual models", names.len());
    Ok(Json(TagsResponse::from_model_names(&names)))
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<ListModelResponse>, DispatchError> {
    let names = state.dispatcher.registry().virtual_models().await?;
    Ok(Json(ListModelResponse::from_model_names(&names)))
}

fn openai_error(status: StatusCode, error: OpenAiError) -> Response {
    (status, Json(error)).into_response()
}

/// OpenAI-compatible chat completions, served by the native `/api/chat` of whichever backend
/// dispatch lands on.
#[instrument(skip(state, headers, body))]
pub async fn chat_completions<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                OpenAiError::new(format!("invalid request body: {e}"), "invalid_request_error"),
            );
        }
    };
    let Some(model) = request.model.clone().filter(|m| !m.is_empty()) else {
        return openai_error(StatusCode::BAD_REQUEST, OpenAiError::missing_model());
    };
    let streaming = request.stream;
    info!("Received chat completion for model: {} (stream: {})", model, streaming);

    let native = request.into_native(&model);
    let dispatch_request = DispatchRequest::post("/api/chat", &model, native).with_headers(headers);

    if streaming {
        let events = match state.dispatcher.dispatch_stream(dispatch_request).await {
            Ok(opened) => adapter::openai_event_stream(opened, model).boxed(),
            Err(e) => {
                warn!("Chat completion stream could not be opened: {}", e);
                stream::once(future::ready(Ok(adapter::sse_error_frame(e.to_string())))).boxed()
            }
        };
        return sse_response(events);
    }

    match state.dispatcher.dispatch(dispatch_request).await {
        Ok(reply) => match adapter::completion_from_native(&reply.body, &model) {
            Ok(completion) => Json(completion).into_response(),
            Err(message) => openai_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                OpenAiError::new(message, "server_error"),
            ),
        },
        Err(e) => openai_error(e.status_code(), OpenAiError::new(e.to_string(), "server_error")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use crate::dispatch::DispatchSettings;
    use crate::registry::{FileRegistry, ServerRecord};
    use crate::test_utils::{MockHttpClient, MockRequest, MockResponse};
    use axum_test::TestServer;
    use serde_json::json;
    use std::sync::Arc;

    fn record(id: u64, host: &str, priority: u32) -> ServerRecord {
        ServerRecord::builder()
            .id(id)
            .virtual_model_name("qwen3")
            .server_url(format!("http://{host}:11434").parse().unwrap())
            .actual_model_name("qwen3:14b")
            .priority(priority)
            .skip_resource_check(true)
            .build()
    }

    fn test_server(records: Vec<ServerRecord>, client: MockHttpClient) -> TestServer {
        let registry = Arc::new(FileRegistry::from_records(records).unwrap());
        let state = AppState::with_client(registry, client, DispatchSettings::default());
        TestServer::new(build_router(state)).unwrap()
    }

    /// Healthy backends that answer each native path the way a real one would.
    fn backend() -> MockHttpClient {
        MockHttpClient::with_handler(|req| match req.path().as_str() {
            "/api/tags" => MockResponse::json(StatusCode::OK, json!({"models": []})),
            "/api/chat" if req.json()["stream"] == true => MockResponse::Stream(
                StatusCode::OK,
                vec![
                    Ok("{\"model\":\"qwen3:14b\",\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n".into()),
                    Ok("{\"model\":\"qwen3:14b\",\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":true}\n".into()),
                ],
            ),
            "/api/chat" => MockResponse::json(
                StatusCode::OK,
                json!({"model": "qwen3:14b", "message": {"role": "assistant", "content": "Hello"}, "done": true}),
            ),
            "/api/generate" => MockResponse::json(
                StatusCode::OK,
                json!({"model": "qwen3:14b", "response": "Hello", "done": true}),
            ),
            "/api/embeddings" => MockResponse::json(StatusCode::OK, json!({"embedding": [0.1, 0.2]})),
            "/api/show" => MockResponse::json(StatusCode::OK, json!({"details": {"family": "qwen3"}})),
            _ => MockResponse::text(StatusCode::NOT_FOUND, ""),
        })
    }

    fn forwarded(client: &MockHttpClient, path: &str) -> Vec<MockRequest> {
        client
            .get_requests()
            .into_iter()
            .filter(|r| r.path() == path)
            .collect()
    }

    #[tokio::test]
    async fn native_chat_round_trips_the_virtual_name() {
        let client = backend();
        let server = test_server(vec![record(1, "a", 1)], client.clone());

        let response = server
            .post("/api/chat")
            .json(&json!({"model": "qwen3", "messages": [{"role": "user", "content": "hi"}]}))
            .await;

        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["message"]["content"], "Hello");

        let sent = forwarded(&client, "/api/chat");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["model"], "qwen3:14b");
        assert_eq!(sent[0].json()["stream"], false);
    }

    #[tokio::test]
    async fn native_chat_stream_is_ndjson_with_virtual_name() {
        let server = test_server(vec![record(1, "a", 1)], backend());

        let response = server
            .post("/api/chat")
            .json(&json!({"model": "qwen3", "messages": [], "stream": true}))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), NDJSON);
        let text = response.text();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l["model"] == "qwen3"));
        assert_eq!(lines[1]["done"], true);
    }

    #[tokio::test]
    async fn missing_model_is_rejected() {
        let client = backend();
        let server = test_server(vec![record(1, "a", 1)], client.clone());

        for path in ["/api/chat", "/api/generate", "/api/embeddings", "/api/show"] {
            let response = server.post(path).json(&json!({"prompt": "hi"})).await;
            assert_eq!(response.status_code(), 400, "{path}");
        }
        let response = server.post("/api/chat").text("not json").await;
        assert_eq!(response.status_code(), 400);
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn show_accepts_name_field() {
        let client = backend();
        let server = test_server(vec![record(1, "a", 1)], client.clone());

        let response = server.post("/api/show").json(&json!({"name": "qwen3"})).await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(forwarded(&client, "/api/show")[0].json()["name"], "qwen3:14b");
    }

    #[tokio::test]
    async fn embeddings_and_generate_are_forwarded() {
        let client = backend();
        let server = test_server(vec![record(1, "a", 1)], client.clone());

        let response = server
            .post("/api/embeddings")
            .json(&json!({"model": "qwen3", "prompt": "hi"}))
            .await;
        assert_eq!(response.json::<Value>()["embedding"], json!([0.1, 0.2]));

        let response = server
            .post("/api/generate")
            .json(&json!({"model": "qwen3", "prompt": "hi"}))
            .await;
        assert_eq!(response.json::<Value>()["model"], "qwen3");
        assert_eq!(forwarded(&client, "/api/generate")[0].json()["model"], "qwen3:14b");
    }

    #[tokio::test]
    async fn exhausted_dispatch_is_a_structured_503() {
        let client = MockHttpClient::with_handler(|_| MockResponse::TransportError("refused".into()));
        let server = test_server(vec![record(1, "a", 1), record(2, "b", 2)], client);

        let response = server
            .post("/api/generate")
            .json(&json!({"model": "qwen3", "prompt": "hi"}))
            .await;

        assert_eq!(response.status_code(), 503);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "exhausted_candidates");
        assert_eq!(body["error"]["attempts"], 2);
    }

    #[tokio::test]
    async fn chat_completion_missing_model_is_openai_error() {
        let server = test_server(vec![record(1, "a", 1)], backend());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {
                "message": "Missing required parameter: model",
                "type": "invalid_request_error",
                "param": "model",
                "code": null
            }})
        );
    }

    #[tokio::test]
    async fn chat_completion_wraps_native_reply() {
        let client = backend();
        let server = test_server(vec![record(1, "a", 1)], client.clone());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({
                "model": "qwen3",
                "messages": [{"role": "user", "content": "hi"}],
                "temperature": 0.5,
                "max_tokens": 32
            }))
            .await;

        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
        assert_eq!(body["usage"]["total_tokens"], 0);

        let sent = forwarded(&client, "/api/chat")[0].json();
        assert_eq!(sent["model"], "qwen3:14b");
        assert_eq!(sent["options"], json!({"temperature": 0.5, "num_predict": 32}));
    }

    #[tokio::test]
    async fn chat_completion_native_error_is_server_error() {
        let client = MockHttpClient::with_handler(|req| match req.path().as_str() {
            "/api/tags" => MockResponse::json(StatusCode::OK, json!({"models": []})),
            _ => MockResponse::json(StatusCode::OK, json!({"error": "model is loading"})),
        });
        let server = test_server(vec![record(1, "a", 1)], client);

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "qwen3", "messages": []}))
            .await;

        assert_eq!(response.status_code(), 500);
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "server_error");
        assert_eq!(body["error"]["message"], "model is loading");
    }

    #[tokio::test]
    async fn chat_completion_stream_is_sse() {
        let server = test_server(vec![record(1, "a", 1)], backend());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "qwen3", "messages": [], "stream": true}))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), "text/event-stream");
        let text = response.text();
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"content\":\"Hel\""));
        assert!(frames[1].contains("\"finish_reason\":\"stop\""));
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn chat_completion_stream_failure_is_in_band() {
        let server = test_server(vec![], backend());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "qwen3", "messages": [], "stream": true}))
            .await;

        assert_eq!(response.status_code(), 200);
        let text = response.text();
        let payload: Value = serde_json::from_str(
            text.trim_end().strip_prefix("data: ").unwrap(),
        )
        .unwrap();
        assert_eq!(payload["error"]["type"], "server_error");
        assert!(!text.contains("[DONE]"));
    }
}
