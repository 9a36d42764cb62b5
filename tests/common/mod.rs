#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use rhone_chat::api::{
    EventStream, ProviderError, ProviderTransport, StreamEvent, StreamOutcome, StreamRequest,
};
use rhone_chat::app::spawn_session;
use rhone_chat::config::Config;
use rhone_chat::service::{ChatService, ChatSession};
use rhone_chat::store::{Chat, Run, Store};

/// One step of a scripted provider stream.
#[derive(Clone)]
pub enum ScriptItem {
    Event(StreamEvent),
    /// Yield a mid-stream transport fault and end the stream.
    Fail(String),
    /// Notify the test that everything before this point has been consumed.
    Signal(Arc<tokio::sync::Notify>),
    /// Park until the run token cancels, then surface the cancellation.
    WaitCancelled,
}

/// Provider transport that replays a fixed event sequence, recording every
/// request it was opened with.
pub struct ScriptedTransport {
    script: Vec<ScriptItem>,
    fail_open: Option<String>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptItem>) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            script,
            fail_open: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_open(details: &str) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            script: Vec::new(),
            fail_open: Some(details.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(details) = &self.fail_open {
            return Err(ProviderError::Start {
                model: request.model,
                details: details.clone(),
            });
        }
        let items = self.script.clone();
        Ok(Box::pin(async_stream::stream! {
            for item in items {
                match item {
                    ScriptItem::Event(event) => yield Ok(event),
                    ScriptItem::Fail(details) => {
                        yield Err(ProviderError::Stream {
                            model: "scripted".to_string(),
                            details,
                        });
                        return;
                    }
                    ScriptItem::Signal(notify) => notify.notify_one(),
                    ScriptItem::WaitCancelled => {
                        token.cancelled().await;
                        yield Err(ProviderError::Cancelled);
                        return;
                    }
                }
            }
        }))
    }
}

pub fn text(delta: &str) -> ScriptItem {
    ScriptItem::Event(StreamEvent::TextDelta {
        text: delta.to_string(),
    })
}

pub fn completed(stop_reason: &str, tool_call_count: u32, turn_count: u32) -> ScriptItem {
    ScriptItem::Event(StreamEvent::Completed {
        outcome: StreamOutcome {
            stop_reason: stop_reason.to_string(),
            tool_call_count,
            turn_count,
            usage: serde_json::json!({"input_tokens": 7, "output_tokens": 3}),
        },
    })
}

pub fn test_config() -> Config {
    Config::load_from(|_| None)
}

pub fn temp_db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("chat.sqlite")
}

pub async fn open_test_store(dir: &TempDir) -> Arc<Store> {
    Arc::new(Store::open(&temp_db_path(dir)).await.expect("open store"))
}

/// Full harness: temp store, service wired to `transport`, one session, and
/// one chat created with the default model.
pub struct Harness {
    pub service: Arc<ChatService>,
    pub session: Arc<ChatSession>,
    pub store: Arc<Store>,
    pub chat: Chat,
    _dir: TempDir,
}

pub async fn harness(transport: Arc<ScriptedTransport>) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = open_test_store(&dir).await;
    let cfg = test_config();
    let service = Arc::new(ChatService::new(
        Arc::clone(&store),
        transport,
        cfg.clone(),
    ));
    let session = ChatSession::new(spawn_session(&cfg.default_model));
    let chat = service
        .create_chat(&cfg.default_model)
        .await
        .expect("create chat");
    Harness {
        service,
        session,
        store,
        chat,
        _dir: dir,
    }
}

/// Poll until the run row reaches a terminal status.
pub async fn wait_for_terminal_run(store: &Store, run_id: &str) -> Run {
    for _ in 0..250 {
        if let Ok(run) = store.get_run(run_id).await {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}

/// Poll until the session view has no active run, returning the settled view.
pub async fn wait_for_idle_session(session: &ChatSession) -> rhone_chat::app::SessionView {
    for _ in 0..250 {
        let view = session.handle().snapshot().await;
        if view.active_run_id.is_empty() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never settled");
}
