//! Thin API over the store, history compactor, and run coordinator, plus the
//! per-session active-run slot that enforces one run per chat at a time.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{ProviderTransport, models};
use crate::app::coordinator::{PendingRun, RunCoordinator};
use crate::app::session::{MessageView, SessionCommand, SessionHandle};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Chat, Message, MessageStatus, Role, Store};

const MAX_TITLE_BYTES: usize = 200;

/// One UI session: the projector handle plus the slot tracking its active
/// run. The slot is what makes a second send refuse while a run is live.
pub struct ChatSession {
    handle: SessionHandle,
    active: Mutex<Option<ActiveRun>>,
}

struct ActiveRun {
    run_id: String,
    token: CancellationToken,
}

impl ChatSession {
    pub fn new(handle: SessionHandle) -> Arc<ChatSession> {
        Arc::new(ChatSession {
            handle,
            active: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn has_active_run(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn try_activate(&self, run_id: &str, token: CancellationToken) -> bool {
        let mut slot = self.active.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(ActiveRun {
            run_id: run_id.to_string(),
            token,
        });
        true
    }

    fn clear_if(&self, run_id: &str) {
        let mut slot = self.active.lock().unwrap();
        if slot.as_ref().is_some_and(|active| active.run_id == run_id) {
            *slot = None;
        }
    }

    fn take_active(&self) -> Option<(String, CancellationToken)> {
        self.active
            .lock()
            .unwrap()
            .take()
            .map(|active| (active.run_id, active.token))
    }
}

pub struct ChatService {
    store: Arc<Store>,
    coordinator: Arc<RunCoordinator>,
    cfg: Config,
}

impl ChatService {
    pub fn new(store: Arc<Store>, transport: Arc<dyn ProviderTransport>, cfg: Config) -> Self {
        let coordinator = Arc::new(RunCoordinator::new(
            Arc::clone(&store),
            transport,
            cfg.clone(),
        ));
        Self {
            store,
            coordinator,
            cfg,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.cfg.default_model
    }

    pub fn allowed_models(&self) -> &'static [&'static str] {
        models::ALLOWED_MODELS
    }

    pub fn is_allowed_model(&self, model: &str) -> bool {
        models::is_allowed(model)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// List chats, creating a first one when the store is empty.
    pub async fn list_or_create_chats(&self, limit: i64) -> Result<Vec<Chat>> {
        let chats = self.store.list_chats(limit).await?;
        if !chats.is_empty() {
            return Ok(chats);
        }
        let created = self
            .store
            .create_chat(
                &Uuid::new_v4().to_string(),
                "New chat",
                &self.cfg.default_model,
                Utc::now(),
            )
            .await?;
        Ok(vec![created])
    }

    pub async fn list_messages(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>> {
        if chat_id.is_empty() {
            return Ok(Vec::new());
        }
        self.store.list_messages(chat_id, limit).await
    }

    pub async fn create_chat(&self, model: &str) -> Result<Chat> {
        let model = if models::is_allowed(model) {
            model
        } else {
            self.cfg.default_model.as_str()
        };
        self.store
            .create_chat(&Uuid::new_v4().to_string(), "New chat", model, Utc::now())
            .await
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<()> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(Error::Validation("chat id is required".to_string()));
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("chat title cannot be empty".to_string()));
        }
        if title.len() > MAX_TITLE_BYTES {
            return Err(Error::Validation("chat title is too long".to_string()));
        }
        self.store.rename_chat(chat_id, title, Utc::now()).await
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(Error::Validation("chat id is required".to_string()));
        }
        self.store.delete_chat(chat_id).await
    }

    /// Start a run for the session's chat. Refuses while the session already
    /// has an active run; otherwise applies the optimistic view patch and
    /// spawns the coordinator on a background task.
    pub async fn start_run(
        &self,
        session: &Arc<ChatSession>,
        chat_id: &str,
        content: &str,
        model: &str,
    ) -> Result<PendingRun> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(Error::Validation("chat id is required".to_string()));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation(
                "message content cannot be empty".to_string(),
            ));
        }
        let model = if models::is_allowed(model) {
            model.to_string()
        } else {
            self.cfg.default_model.clone()
        };

        let run = PendingRun {
            run_id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_message_id: Uuid::new_v4().to_string(),
            assistant_message_id: Uuid::new_v4().to_string(),
            model: model.clone(),
            user_content: content.to_string(),
        };

        let token = CancellationToken::new();
        if !session.try_activate(&run.run_id, token.clone()) {
            return Err(Error::Conflict(
                "a run is already active for this session".to_string(),
            ));
        }

        let now = Utc::now();
        session.handle.send(SessionCommand::RunStarted {
            run_id: run.run_id.clone(),
            assistant_id: run.assistant_message_id.clone(),
            user: MessageView {
                id: run.user_message_id.clone(),
                role: Role::User,
                content: content.to_string(),
                status: MessageStatus::Complete,
                tool_calls: Vec::new(),
                created_at: now,
            },
            assistant: MessageView {
                id: run.assistant_message_id.clone(),
                role: Role::Assistant,
                content: String::new(),
                status: MessageStatus::Streaming,
                tool_calls: Vec::new(),
                created_at: now,
            },
            model,
        });

        info!(run_id = %run.run_id, chat_id = %run.chat_id, "starting run");

        let coordinator = Arc::clone(&self.coordinator);
        let store = Arc::clone(&self.store);
        let session = Arc::clone(session);
        let background_run = run.clone();
        tokio::spawn(async move {
            let handle = session.handle.clone();
            let report = coordinator
                .execute(background_run.clone(), &handle, token)
                .await;
            session.clear_if(&background_run.run_id);
            info!(
                run_id = %background_run.run_id,
                status = report.status.as_str(),
                "run settled"
            );
            // The run touched the chat; refresh the sidebar ordering.
            match store.list_chats(200).await {
                Ok(chats) => handle.send(SessionCommand::SetChats(chats)),
                Err(err) => warn!(error = %err, "failed to reload chats after run"),
            }
        });

        Ok(run)
    }

    /// Stop the session's active run, if any. Clears the active marker first
    /// so later patches from the run are dropped, then cancels its token.
    pub fn stop_run(&self, session: &ChatSession) {
        let Some((run_id, token)) = session.take_active() else {
            return;
        };
        info!(run_id = %run_id, "stopping run");
        session
            .handle
            .send(SessionCommand::RunStopped {
                run_id: run_id.clone(),
            });
        token.cancel();
    }
}
