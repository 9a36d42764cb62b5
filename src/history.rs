//! Builds the bounded history window handed to the provider.

use crate::api::provider::{ChatMessage, ChatRole};
use crate::error::Result;
use crate::store::{Role, Store};

const HISTORY_LOAD_LIMIT: i64 = 800;

/// Produce the provider history for a chat: one leading system message with
/// the base prompt, followed by the last `max_history` non-empty user and
/// assistant messages in chronological order. Dropping oldest middle entries
/// keeps the most recent turn pair; the system prompt is always retained.
pub async fn build_history(
    store: &Store,
    chat_id: &str,
    system_prompt: &str,
    max_history: usize,
) -> Result<Vec<ChatMessage>> {
    let rows = store.list_messages(chat_id, HISTORY_LOAD_LIMIT).await?;

    let mut history = Vec::with_capacity(max_history + 1);
    history.push(ChatMessage {
        role: ChatRole::System,
        content: system_prompt.to_string(),
    });
    for row in rows {
        let role = match row.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
            Role::System => continue,
        };
        if role == ChatRole::Assistant && row.content.trim().is_empty() {
            continue;
        }
        history.push(ChatMessage {
            role,
            content: row.content,
        });
    }

    if history.len() <= max_history + 1 {
        return Ok(history);
    }

    let mut trimmed = Vec::with_capacity(max_history + 1);
    trimmed.push(history[0].clone());
    trimmed.extend_from_slice(&history[history.len() - max_history..]);
    Ok(trimmed)
}
