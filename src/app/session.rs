//! Single-writer projector for the per-session conversation view.
//!
//! All mutations flow through one dispatch queue; background tasks submit
//! commands and never touch the view directly. Run-scoped commands carry the
//! run that produced them and are dropped once `active_run_id` moved on, so a
//! cancelled run cannot pollute its successor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::store::{Chat, Message, MessageStatus, Role, ToolCallStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallView {
    pub id: String,
    pub name: String,
    pub status: ToolCallStatus,
    pub input: String,
    pub output: String,
    pub error_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub tool_calls: Vec<ToolCallView>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> MessageView {
        MessageView {
            id: message.id,
            role: message.role,
            content: message.content,
            status: message.status,
            tool_calls: Vec::new(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub chats: Vec<Chat>,
    pub messages: Vec<MessageView>,
    pub active_chat_id: String,
    pub active_run_id: String,
    pub active_assistant_id: String,
    pub input: String,
    pub selected_model: String,
    pub is_thinking: bool,
    pub error: String,
    pub theme: String,
}

impl SessionView {
    pub fn new(default_model: &str) -> SessionView {
        SessionView {
            chats: Vec::new(),
            messages: Vec::new(),
            active_chat_id: String::new(),
            active_run_id: String::new(),
            active_assistant_id: String::new(),
            input: String::new(),
            selected_model: default_model.to_string(),
            is_thinking: false,
            error: String::new(),
            theme: "dark".to_string(),
        }
    }

    fn append_chunk(&mut self, assistant_id: &str, chunk: &str) {
        if let Some(message) = self.message_mut(assistant_id) {
            message.content.push_str(chunk);
            message.status = MessageStatus::Streaming;
        }
    }

    fn mark_status(&mut self, assistant_id: &str, status: MessageStatus) {
        if let Some(message) = self.message_mut(assistant_id) {
            message.status = status;
        }
    }

    fn set_error_on(&mut self, assistant_id: &str, message_text: &str) {
        let text = if message_text.trim().is_empty() {
            "Assistant request failed."
        } else {
            message_text
        };
        if let Some(message) = self.message_mut(assistant_id) {
            message.status = MessageStatus::Error;
            if message.content.trim().is_empty() {
                message.content = format!("Error: {text}");
            }
        }
    }

    fn add_tool_call(&mut self, assistant_id: &str, call: ToolCallView) {
        if let Some(message) = self.message_mut(assistant_id) {
            message.tool_calls.push(call);
        }
    }

    fn update_tool_call(
        &mut self,
        assistant_id: &str,
        call_id: &str,
        status: ToolCallStatus,
        output: String,
        error_text: String,
    ) {
        let Some(message) = self.message_mut(assistant_id) else {
            return;
        };
        if let Some(call) = message.tool_calls.iter_mut().find(|c| c.id == call_id) {
            call.status = status;
            call.output = output;
            call.error_text = error_text;
            return;
        }
        // Result arrived without a visible start; surface it anyway.
        message.tool_calls.push(ToolCallView {
            id: call_id.to_string(),
            name: String::new(),
            status,
            input: String::new(),
            output,
            error_text,
        });
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut MessageView> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    SetChats(Vec<Chat>),
    SetMessages(Vec<MessageView>),
    SetActiveChat(String),
    SetSelectedModel(String),
    SetInput(String),
    SetTheme(String),
    SetError(String),

    /// Optimistic insert of the user turn and assistant placeholder; marks
    /// the run active for this session.
    RunStarted {
        run_id: String,
        assistant_id: String,
        user: MessageView,
        assistant: MessageView,
        model: String,
    },
    /// User stop: clears the active markers so later patches from the run
    /// are dropped, and shows the assistant as cancelled.
    RunStopped {
        run_id: String,
    },

    AppendChunk {
        run_id: String,
        assistant_id: String,
        chunk: String,
    },
    ThinkingStarted {
        run_id: String,
    },
    AddToolCall {
        run_id: String,
        assistant_id: String,
        call: ToolCallView,
    },
    UpdateToolCall {
        run_id: String,
        assistant_id: String,
        call_id: String,
        status: ToolCallStatus,
        output: String,
        error_text: String,
    },
    RunFinished {
        run_id: String,
        assistant_id: String,
        status: MessageStatus,
        error_text: String,
    },

    /// Synchronization probe: replies with the view after everything queued
    /// ahead of it has been applied.
    Snapshot(oneshot::Sender<SessionView>),
}

/// Apply one command to a fresh copy of the view. Returns `None` when the
/// command was dropped (stale run).
pub fn apply(current: &SessionView, command: SessionCommand) -> Option<SessionView> {
    let mut view = current.clone();
    match command {
        SessionCommand::SetChats(chats) => view.chats = chats,
        SessionCommand::SetMessages(messages) => view.messages = messages,
        SessionCommand::SetActiveChat(chat_id) => view.active_chat_id = chat_id,
        SessionCommand::SetSelectedModel(model) => view.selected_model = model,
        SessionCommand::SetInput(input) => view.input = input,
        SessionCommand::SetTheme(theme) => view.theme = theme,
        SessionCommand::SetError(error) => view.error = error,

        SessionCommand::RunStarted {
            run_id,
            assistant_id,
            user,
            assistant,
            model,
        } => {
            view.messages.push(user);
            view.messages.push(assistant);
            view.active_run_id = run_id;
            view.active_assistant_id = assistant_id;
            view.selected_model = model;
            view.input.clear();
            view.is_thinking = true;
            view.error.clear();
        }
        SessionCommand::RunStopped { run_id } => {
            if view.active_run_id != run_id {
                return None;
            }
            let assistant_id = std::mem::take(&mut view.active_assistant_id);
            view.active_run_id.clear();
            view.is_thinking = false;
            view.mark_status(&assistant_id, MessageStatus::Cancelled);
        }

        SessionCommand::AppendChunk {
            run_id,
            assistant_id,
            chunk,
        } => {
            if view.active_run_id != run_id {
                return None;
            }
            view.append_chunk(&assistant_id, &chunk);
            view.is_thinking = false;
        }
        SessionCommand::ThinkingStarted { run_id } => {
            if view.active_run_id != run_id {
                return None;
            }
            view.is_thinking = true;
        }
        SessionCommand::AddToolCall {
            run_id,
            assistant_id,
            call,
        } => {
            if view.active_run_id != run_id {
                return None;
            }
            view.add_tool_call(&assistant_id, call);
        }
        SessionCommand::UpdateToolCall {
            run_id,
            assistant_id,
            call_id,
            status,
            output,
            error_text,
        } => {
            if view.active_run_id != run_id {
                return None;
            }
            view.update_tool_call(&assistant_id, &call_id, status, output, error_text);
        }
        SessionCommand::RunFinished {
            run_id,
            assistant_id,
            status,
            error_text,
        } => {
            if view.active_run_id != run_id {
                return None;
            }
            view.active_run_id.clear();
            view.active_assistant_id.clear();
            view.is_thinking = false;
            view.mark_status(&assistant_id, status);
            if status == MessageStatus::Error {
                view.set_error_on(&assistant_id, &error_text);
            }
            if !error_text.is_empty() {
                view.error = error_text;
            }
        }

        SessionCommand::Snapshot(_) => unreachable!("snapshot handled by the dispatch loop"),
    }
    Some(view)
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    snapshots: broadcast::Sender<SessionView>,
}

impl SessionHandle {
    /// Enqueue a command; fire-and-forget from the caller's perspective.
    pub fn send(&self, command: SessionCommand) {
        let _ = self.tx.send(command);
    }

    /// Current view, observed after every command queued before this call.
    pub async fn snapshot(&self) -> SessionView {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(SessionCommand::Snapshot(reply_tx));
        reply_rx.await.unwrap_or_else(|_| SessionView::new(""))
    }

    /// Subscribe to serialized view snapshots, one per applied mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionView> {
        self.snapshots.subscribe()
    }
}

/// Spawn the projector task and return its handle. The task exits when the
/// last handle is dropped.
pub fn spawn_session(default_model: &str) -> SessionHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (snapshot_tx, _) = broadcast::channel(64);
    let snapshots = snapshot_tx.clone();
    let mut view = SessionView::new(default_model);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let command = match command {
                SessionCommand::Snapshot(reply) => {
                    let _ = reply.send(view.clone());
                    continue;
                }
                other => other,
            };
            match apply(&view, command) {
                Some(next) => {
                    view = next;
                    let _ = snapshot_tx.send(view.clone());
                }
                None => debug!("dropped stale session patch"),
            }
        }
    });

    SessionHandle { tx, snapshots }
}
