//! Translation between what callers send and what backends understand
//!
//! Native calls only need the model name swapped: virtual to actual on the way in, actual back to
//! virtual on the way out. OpenAI-compatible calls are additionally converted to and from the
//! native chat shape, including re-encoding native NDJSON streams as server-sent events.
use crate::dispatch::{OpenedStream, UpstreamBody};
use crate::errors::StreamMidFlightError;
use crate::framing::LineFramedStream;
use crate::models::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, OpenAiError};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, future, stream};
use serde_json::{Map, Value, json};
use std::convert::Infallible;
use tracing::{debug, warn};

pub(crate) const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Point the outgoing body at the backend's model. `name` is swapped too when it names the virtual
/// model, since `/api/show` accepts either field.
pub fn rewrite_request_model(body: &mut Value, virtual_model: &str, actual_model: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    if obj.contains_key("model") {
        obj.insert("model".into(), Value::String(actual_model.to_owned()));
    }
    if obj.get("name").and_then(Value::as_str) == Some(virtual_model) {
        obj.insert("name".into(), Value::String(actual_model.to_owned()));
    }
}

/// Hide the backend's model name from the caller.
pub fn restore_response_model(body: &mut Value, virtual_model: &str, actual_model: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    if obj.contains_key("model") {
        obj.insert("model".into(), Value::String(virtual_model.to_owned()));
    } else if let Some(Value::Array(models)) = obj.get_mut("models") {
        for entry in models.iter_mut().filter_map(Value::as_object_mut) {
            if entry.get("name").and_then(Value::as_str) == Some(actual_model) {
                entry.insert("name".into(), Value::String(virtual_model.to_owned()));
            }
        }
    }
}

/// Rewrite one NDJSON line. Blank lines are dropped, lines that are not JSON pass through as-is.
pub fn rewrite_chunk(line: &[u8], virtual_model: &str) -> Option<Bytes> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let mut out = match serde_json::from_slice::<Value>(line) {
        Ok(Value::Object(mut obj)) if obj.contains_key("model") => {
            obj.insert("model".into(), Value::String(virtual_model.to_owned()));
            serde_json::to_vec(&obj).unwrap_or_else(|_| line.to_vec())
        }
        _ => line.to_vec(),
    };
    if out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
    Some(Bytes::from(out))
}

fn ndjson_error_line(err: &StreamMidFlightError) -> Bytes {
    let mut line = json!({ "error": err.to_string() }).to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

/// The native passthrough body: upstream lines with the model name restored. A transport failure
/// after the stream has opened ends it with a single `{"error": ...}` line.
pub fn native_stream(
    opened: OpenedStream,
    virtual_model: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let server_url = opened.server.server_url.to_string();
    let request_id = opened.request_id;
    LineFramedStream::new(opened.body)
        .scan(false, move |failed, item| {
            if *failed {
                return future::ready(None);
            }
            let out = match item {
                Ok(line) => rewrite_chunk(&line, &virtual_model),
                Err(e) => {
                    *failed = true;
                    let err = StreamMidFlightError {
                        server_url: server_url.clone(),
                        detail: e.to_string(),
                    };
                    warn!(request_id = %request_id, "{}", err);
                    Some(ndjson_error_line(&err))
                }
            };
            future::ready(Some(out))
        })
        .filter_map(|line| future::ready(line.map(Ok)))
}

impl ChatCompletionRequest {
    /// The native `/api/chat` body for this request.
    pub fn into_native(self, model: &str) -> Value {
        let mut options = Map::new();
        if let Some(temperature) = self.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = self.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }
        if let Some(top_p) = self.top_p {
            options.insert("top_p".into(), json!(top_p));
        }

        let mut body = json!({
            "model": model,
            "messages": self.messages,
            "stream": self.stream,
        });
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

fn native_content(reply: &Value) -> String {
    match reply.get("message") {
        Some(Value::Object(message)) => message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        Some(Value::String(message)) => message.clone(),
        _ => match reply.get("response") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
    }
}

/// Wrap a buffered native chat reply. A reply carrying `error` is returned as `Err` with its
/// message.
pub fn completion_from_native(reply: &Value, model: &str) -> Result<ChatCompletionResponse, String> {
    if let Some(error) = reply.get("error") {
        return Err(match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        });
    }
    Ok(ChatCompletionResponse::new(model, native_content(reply)))
}

pub fn chunk_from_native(chunk: &Value, model: &str) -> ChatCompletionChunk {
    let done = chunk.get("done").and_then(Value::as_bool).unwrap_or(false);
    ChatCompletionChunk::new(model, native_content(chunk), done)
}

fn sse_frame<T: serde::Serialize>(payload: &T) -> Vec<u8> {
    let mut frame = b"data: ".to_vec();
    // Serializing these plain structs cannot fail.
    frame.extend(serde_json::to_vec(payload).unwrap_or_default());
    frame.extend_from_slice(b"\n\n");
    frame
}

/// A complete SSE error frame, `data: {"error": {...}}`.
pub fn sse_error_frame(message: impl Into<String>) -> Bytes {
    Bytes::from(sse_frame(&OpenAiError::new(message, "server_error")))
}

struct EventState {
    lines: LineFramedStream<UpstreamBody>,
    model: String,
    server_url: String,
    request_id: String,
    finished: bool,
}

/// Re-encode a native chat stream as OpenAI chunk events. Lines that are not JSON are skipped.
/// `[DONE]` follows the chunk marked `done`, or the end of the upstream body if none was. An error
/// mid-stream ends it with an error frame and no `[DONE]`.
pub fn openai_event_stream(
    opened: OpenedStream,
    model: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let state = EventState {
        lines: LineFramedStream::new(opened.body),
        model,
        server_url: opened.server.server_url.to_string(),
        request_id: opened.request_id,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            match state.lines.next().await {
                Some(Ok(line)) => {
                    let Ok(chunk) = serde_json::from_slice::<Value>(&line) else {
                        debug!(request_id = %state.request_id, "Dropping non-JSON stream line");
                        continue;
                    };
                    if let Some(error) = chunk.get("error") {
                        state.finished = true;
                        let message = error.as_str().map(str::to_owned).unwrap_or_else(|| error.to_string());
                        return Some((Ok(sse_error_frame(message)), state));
                    }
                    let chunk = chunk_from_native(&chunk, &state.model);
                    let done = chunk.choices.iter().any(|c| c.finish_reason.is_some());
                    let mut frame = sse_frame(&chunk);
                    if done {
                        frame.extend_from_slice(SSE_DONE);
                        state.finished = true;
                    }
                    return Some((Ok(Bytes::from(frame)), state));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = StreamMidFlightError {
                        server_url: state.server_url.clone(),
                        detail: e.to_string(),
                    };
                    warn!(request_id = %state.request_id, "{}", err);
                    return Some((Ok(sse_error_frame(err.to_string())), state));
                }
                None => {
                    state.finished = true;
                    return Some((Ok(Bytes::from_static(SSE_DONE)), state));
                }
            }
        }
    })
}
