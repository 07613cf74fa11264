/// Wire types for the locally answered endpoints and the OpenAI-compatible surface.
///
/// Virtual models are what callers see: `/api/tags` and `/v1/models` list them straight from the
/// registry without contacting any backend.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who `/v1/models` reports as the owner of every virtual model.
pub const OWNED_BY: &str = "spillway";

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    /// The virtual model name, which can be referenced in the API endpoints.
    pub id: String,
    /// The Unix timestamp (in seconds) at which the listing was produced.
    pub created: u64,
    /// The object type, which is always "model".
    pub object: String,
    pub owned_by: String,
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub fn from_model_names(model_names: &[String]) -> Self {
        let created = unix_now();
        let data = model_names
            .iter()
            .map(|name| Model {
                id: name.clone(),
                created,
                object: "model".into(),
                owned_by: OWNED_BY.into(),
            })
            .collect::<Vec<_>>();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}

/// One entry of the native `/api/tags` listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TagModel {
    pub name: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    pub digest: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TagsResponse {
    pub models: Vec<TagModel>,
}

impl TagsResponse {
    pub fn from_model_names(model_names: &[String]) -> Self {
        let now = Utc::now();
        TagsResponse {
            models: model_names
                .iter()
                .map(|name| TagModel {
                    name: name.clone(),
                    modified_at: now,
                    size: 0,
                    digest: "virtual-model".into(),
                })
                .collect(),
        }
    }
}

/// The subset of an OpenAI chat completion request that maps onto a native chat call.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

/// Token counts are not computed; every field is zero.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn new(model: &str, content: String) -> Self {
        let created = unix_now();
        Self {
            id: format!("chatcmpl-{created}"),
            object: "chat.completion".into(),
            created,
            model: model.to_owned(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: Some("stop".into()),
            }],
            usage: Usage::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Delta {
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn new(model: &str, content: String, done: bool) -> Self {
        let created = unix_now();
        Self {
            id: format!("chatcmpl-{created}"),
            object: "chat.completion.chunk".into(),
            created,
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta { content },
                finish_reason: done.then(|| "stop".to_owned()),
            }],
        }
    }
}

/// OpenAI-style error body: `{"error": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpenAiError {
    pub error: OpenAiErrorDetail,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpenAiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub code: Option<String>,
}

impl OpenAiError {
    pub fn new(message: impl Into<String>, kind: &str) -> Self {
        Self {
            error: OpenAiErrorDetail {
                message: message.into(),
                kind: kind.into(),
                param: None,
                code: None,
            },
        }
    }

    pub fn missing_model() -> Self {
        let mut err = Self::new("Missing required parameter: model", "invalid_request_error");
        err.error.param = Some("model".into());
        err
    }
}
