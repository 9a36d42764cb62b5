//! Streaming transport for an Anthropic-compatible messages endpoint with the
//! provider-executed `web_search` server tool.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{self, header};
use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::error::ProviderError;
use crate::api::models;
use crate::api::provider::{
    ChatRole, EventStream, ProviderTransport, StreamEvent, StreamOutcome, StreamRequest,
    ToolChoice, split_system,
};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";
const MAX_TOKENS: u32 = 8000;

#[derive(Clone)]
pub struct AnthropicTransport {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_uses: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ApiToolChoice {
    #[serde(rename = "type")]
    choice_type: &'static str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ApiToolChoice>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: WireMessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: WireContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: WireDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<serde_json::Value>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: WireError },
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(rename = "signature_delta")]
    SignatureDelta,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    error_type: String,
}

/// In-flight server tool invocation, assembled from streamed input deltas.
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

impl AnthropicTransport {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(api_key)
                .unwrap_or_else(|_| header::HeaderValue::from_static("")),
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http_client: client,
            base_url: base_url.to_string(),
        }
    }

    fn build_request(&self, request: &StreamRequest) -> Result<CompletionRequest, ProviderError> {
        let resolved = models::resolve(&request.model).ok_or_else(|| ProviderError::Start {
            model: request.model.clone(),
            details: "unsupported model".to_string(),
        })?;

        let (history, system) = split_system(&request.messages);
        let messages: Vec<ApiMessage> = history
            .into_iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| ApiMessage {
                role: match message.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                content: message.content,
            })
            .collect();

        if messages.is_empty() {
            return Err(ProviderError::InvalidRequest {
                provider: self.name().to_string(),
                details: "no messages provided".to_string(),
            });
        }

        let tools: Vec<ApiTool> = request
            .tools
            .iter()
            .filter_map(|tool| {
                if tool.name == "web_search" {
                    Some(ApiTool {
                        tool_type: WEB_SEARCH_TOOL_TYPE,
                        name: tool.name.clone(),
                        max_uses: tool.max_uses,
                    })
                } else {
                    warn!(tool = %tool.name, "skipping tool with no wire mapping");
                    None
                }
            })
            .collect();

        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some(ApiToolChoice {
                choice_type: match request.tool_choice {
                    ToolChoice::Auto => "auto",
                    ToolChoice::None => "none",
                },
            })
        };

        Ok(CompletionRequest {
            model: resolved.to_string(),
            max_tokens: MAX_TOKENS,
            stream: true,
            system,
            messages,
            tools,
            tool_choice,
        })
    }
}

#[async_trait]
impl ProviderTransport for AnthropicTransport {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn open(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        let body = self.build_request(&request)?;
        debug!(model = %body.model, messages = body.messages.len(), "opening provider stream");

        let request_builder = self.http_client.post(&self.base_url).json(&body);

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(ProviderError::Cancelled);
            }
            res = request_builder.send() => {
                res?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::AuthenticationFailed {
                    provider: self.name().to_string(),
                    details: error_text,
                },
                429 => ProviderError::RateLimited {
                    provider: self.name().to_string(),
                    details: error_text,
                },
                400..=499 => ProviderError::InvalidRequest {
                    provider: self.name().to_string(),
                    details: error_text,
                },
                _ => ProviderError::Server {
                    provider: self.name().to_string(),
                    status: status.as_u16(),
                    details: error_text,
                },
            });
        }

        let events = wire_events(response.bytes_stream());
        Ok(Box::pin(convert_wire_stream(
            events,
            request.model.clone(),
            token,
        )))
    }
}

/// Decode a server-sent-event byte stream straight into typed wire events.
/// Frames carrying event kinds this crate does not model are dropped here,
/// so the run loop only ever sees events it can act on; transport-level
/// parse faults surface as `ProviderError::Sse`.
fn wire_events<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<WireEvent, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    byte_stream
        .map(|result| result.map_err(|e| std::io::Error::other(e.to_string())))
        .eventsource()
        .filter_map(|result| async move {
            let frame = match result {
                Ok(frame) => frame,
                Err(err) => {
                    return Some(Err(ProviderError::Sse {
                        details: err.to_string(),
                    }));
                }
            };
            if frame.data.is_empty() {
                return None;
            }
            match serde_json::from_str::<WireEvent>(&frame.data) {
                Ok(event) => Some(Ok(event)),
                // Event kinds come and go with API revisions.
                Err(_) => None,
            }
        })
}

fn convert_wire_stream<S>(
    events: S,
    model: String,
    token: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent, ProviderError>> + Send
where
    S: Stream<Item = Result<WireEvent, ProviderError>> + Send + 'static,
{
    async_stream::stream! {
        let mut pending_tool: Option<PendingToolUse> = None;
        let mut stop_reason: Option<String> = None;
        let mut usage = serde_json::Value::Null;
        let mut tool_call_count: u32 = 0;
        let mut turn_count: u32 = 0;
        let mut completed = false;

        tokio::pin!(events);

        while let Some(event_result) = events.next().await {
            if token.is_cancelled() {
                yield Err(ProviderError::Cancelled);
                return;
            }

            let wire = match event_result {
                Ok(event) => event,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            match wire {
                WireEvent::MessageStart { message } => {
                    turn_count += 1;
                    if let Some(value) = message.usage {
                        usage = value;
                    }
                }
                WireEvent::ContentBlockStart { content_block, .. } => {
                    match content_block.block_type.as_str() {
                        "server_tool_use" | "tool_use" => {
                            if let (Some(id), Some(name)) =
                                (content_block.id, content_block.name)
                            {
                                tool_call_count += 1;
                                pending_tool = Some(PendingToolUse {
                                    id,
                                    name,
                                    input_json: String::new(),
                                });
                            }
                        }
                        "web_search_tool_result" => {
                            let id = content_block.tool_use_id.unwrap_or_default();
                            let payload = content_block
                                .content
                                .unwrap_or(serde_json::Value::Null);
                            let (content, error) = split_tool_result(payload);
                            yield Ok(StreamEvent::ToolCallResult {
                                id,
                                name: "web_search".to_string(),
                                content,
                                error,
                            });
                        }
                        _ => {}
                    }
                }
                WireEvent::ContentBlockDelta { delta, .. } => match delta {
                    WireDelta::TextDelta { text } => {
                        yield Ok(StreamEvent::TextDelta { text });
                    }
                    WireDelta::ThinkingDelta { thinking } => {
                        yield Ok(StreamEvent::ThinkingDelta { text: thinking });
                    }
                    WireDelta::InputJsonDelta { partial_json } => {
                        if let Some(tool) = pending_tool.as_mut() {
                            tool.input_json.push_str(&partial_json);
                        }
                    }
                    WireDelta::SignatureDelta => {}
                },
                WireEvent::ContentBlockStop { .. } => {
                    if let Some(tool) = pending_tool.take() {
                        let input: serde_json::Value = serde_json::from_str(&tool.input_json)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                        yield Ok(StreamEvent::ToolCallStart {
                            id: tool.id,
                            name: tool.name,
                            input,
                        });
                    }
                }
                WireEvent::MessageDelta { delta, usage: delta_usage } => {
                    if let Some(reason) = delta.stop_reason {
                        stop_reason = Some(reason);
                    }
                    if let Some(value) = delta_usage {
                        usage = value;
                    }
                }
                WireEvent::MessageStop => {
                    let reason = stop_reason.clone().unwrap_or_default();
                    if reason == "error" {
                        yield Err(ProviderError::ErrorStop { model: model.clone() });
                        return;
                    }
                    completed = true;
                    yield Ok(StreamEvent::Completed {
                        outcome: StreamOutcome {
                            stop_reason: reason,
                            tool_call_count,
                            turn_count,
                            usage: usage.clone(),
                        },
                    });
                }
                WireEvent::Error { error } => {
                    yield Err(ProviderError::Stream {
                        model: model.clone(),
                        details: format!("{}: {}", error.error_type, error.message),
                    });
                    return;
                }
                WireEvent::Ping => {}
            }
        }

        if !completed && !token.is_cancelled() {
            yield Err(ProviderError::Stream {
                model,
                details: "stream ended before message_stop".to_string(),
            });
        }
    }
}

/// A tool result payload is either an array of result blocks or a single
/// error object with an `error_code`.
fn split_tool_result(payload: serde_json::Value) -> (Vec<serde_json::Value>, Option<String>) {
    match payload {
        serde_json::Value::Array(blocks) => (blocks, None),
        serde_json::Value::Object(map) => {
            let code = map
                .get("error_code")
                .and_then(|v| v.as_str())
                .unwrap_or("tool_error")
                .to_string();
            (Vec::new(), Some(code))
        }
        serde_json::Value::Null => (Vec::new(), None),
        other => (vec![other], None),
    }
}
