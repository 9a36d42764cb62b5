use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::api::error::ProviderError;

/// Role of a history entry handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
}

/// A capability the provider may invoke server-side during the run.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub max_uses: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// User-visible model alias; transports resolve it before the request.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub max_turns: u32,
    pub tool_timeout: Duration,
}

/// One event from the provider stream, in arrival order. `Completed` is
/// terminal and carries the run summary; a stream that ends without it is a
/// transport fault.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolCallResult {
        id: String,
        name: String,
        content: Vec<serde_json::Value>,
        error: Option<String>,
    },
    Completed {
        outcome: StreamOutcome,
    },
}

#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub stop_reason: String,
    pub tool_call_count: u32,
    pub turn_count: u32,
    pub usage: serde_json::Value,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Abstract streaming transport. One run maps to one `open` call; the
/// returned stream must abandon in-flight I/O promptly once `token` trips.
#[async_trait]
pub trait ProviderTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<EventStream, ProviderError>;
}

/// Split system entries out of a history window, merging their trimmed
/// contents in submission order with a blank-line separator.
pub fn split_system(messages: &[ChatMessage]) -> (Vec<ChatMessage>, Option<String>) {
    let mut request_messages = Vec::with_capacity(messages.len());
    let mut system_parts: Vec<&str> = Vec::new();
    for message in messages {
        if message.role == ChatRole::System {
            let text = message.content.trim();
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }
        request_messages.push(message.clone());
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (request_messages, system)
}

/// Serialize tool result content blocks to newline-joined compact JSON.
pub fn content_blocks_to_text(blocks: &[serde_json::Value]) -> String {
    blocks
        .iter()
        .filter_map(|block| serde_json::to_string(block).ok())
        .collect::<Vec<_>>()
        .join("\n")
}
