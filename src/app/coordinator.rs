//! Drives one run end-to-end: persists the initial triple, streams provider
//! events, paces the two sinks, and finalizes the run exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::api::provider::{
    ProviderTransport, StreamEvent, StreamOutcome, StreamRequest, ToolChoice, ToolSpec,
    content_blocks_to_text,
};
use crate::app::session::{SessionCommand, SessionHandle, ToolCallView};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::history::build_history;
use crate::store::{
    self, Message, MessageStatus, Role, Run, RunStatus, Store, ToolCall, ToolCallStatus,
};
use crate::util::truncate_bytes;

const TOOL_INPUT_MAX_BYTES: usize = 4096;
const TOOL_OUTPUT_MAX_BYTES: usize = 4096;
const TOOL_ERROR_MAX_BYTES: usize = 2048;
const TOOL_PREVIEW_BYTES: usize = 500;
const TOOL_ERROR_PREVIEW_BYTES: usize = 300;

/// Identifiers for a run whose rows are about to be written. All IDs are
/// allocated by the caller before anything is persisted.
#[derive(Debug, Clone)]
pub struct PendingRun {
    pub run_id: String,
    pub chat_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub model: String,
    pub user_content: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub error_text: String,
}

enum StreamEnd {
    Completed(StreamOutcome),
    Failed(Error),
}

pub struct RunCoordinator {
    store: Arc<Store>,
    transport: Arc<dyn ProviderTransport>,
    cfg: Config,
}

impl RunCoordinator {
    pub fn new(store: Arc<Store>, transport: Arc<dyn ProviderTransport>, cfg: Config) -> Self {
        Self {
            store,
            transport,
            cfg,
        }
    }

    /// Run the full lifecycle for `run`. Never panics the process; every
    /// outcome converges to a terminal report.
    pub async fn execute(
        &self,
        run: PendingRun,
        session: &SessionHandle,
        token: CancellationToken,
    ) -> RunReport {
        if let Err(err) = self.persist_start(&run).await {
            let error_text = err.to_string();
            error!(run_id = %run.run_id, error = %error_text, "failed to persist run start");
            session.send(SessionCommand::RunFinished {
                run_id: run.run_id.clone(),
                assistant_id: run.assistant_message_id.clone(),
                status: MessageStatus::Error,
                error_text: error_text.clone(),
            });
            return RunReport {
                status: RunStatus::Error,
                error_text,
            };
        }

        let mut sinks = StreamSinks::new(
            &self.store,
            session,
            &run.run_id,
            &run.assistant_message_id,
            self.cfg.ui_flush_interval,
            self.cfg.ui_flush_bytes,
            self.cfg.db_flush_interval,
        );

        let end = self.drive(&run, session, &mut sinks, token).await;
        self.finalize(&run, session, sinks, end).await
    }

    /// Initial triple: user message, assistant placeholder, run row, plus the
    /// chat touch, all inside one transaction. The chat model update follows
    /// outside it.
    async fn persist_start(&self, run: &PendingRun) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        store::insert_message_tx(
            &mut *tx,
            &Message {
                id: run.user_message_id.clone(),
                chat_id: run.chat_id.clone(),
                role: Role::User,
                content: run.user_content.clone(),
                status: MessageStatus::Complete,
                created_at: now,
                updated_at: now,
            },
        )
        .await?;
        store::insert_message_tx(
            &mut *tx,
            &Message {
                id: run.assistant_message_id.clone(),
                chat_id: run.chat_id.clone(),
                role: Role::Assistant,
                content: String::new(),
                status: MessageStatus::Streaming,
                created_at: now,
                updated_at: now,
            },
        )
        .await?;
        store::upsert_run_start_tx(
            &mut *tx,
            &Run {
                id: run.run_id.clone(),
                chat_id: run.chat_id.clone(),
                user_message_id: run.user_message_id.clone(),
                assistant_message_id: run.assistant_message_id.clone(),
                model: run.model.clone(),
                status: RunStatus::Running,
                stop_reason: None,
                error_text: None,
                tool_call_count: 0,
                turn_count: 0,
                usage_json: None,
                started_at: now,
                finished_at: None,
            },
        )
        .await?;
        store::touch_chat_tx(&mut *tx, &run.chat_id, now).await?;
        tx.commit().await?;

        self.store
            .update_chat_model(&run.chat_id, &run.model, now)
            .await?;
        Ok(())
    }

    async fn drive(
        &self,
        run: &PendingRun,
        session: &SessionHandle,
        sinks: &mut StreamSinks<'_>,
        token: CancellationToken,
    ) -> StreamEnd {
        let history = match build_history(
            &self.store,
            &run.chat_id,
            &self.cfg.system_prompt,
            self.cfg.max_history,
        )
        .await
        {
            Ok(history) => history,
            Err(err) => return StreamEnd::Failed(err),
        };

        let request = StreamRequest {
            model: run.model.clone(),
            messages: history,
            tools: vec![ToolSpec {
                name: "web_search".to_string(),
                max_uses: Some(self.cfg.max_tool_calls),
            }],
            tool_choice: ToolChoice::Auto,
            max_turns: self.cfg.max_turns,
            tool_timeout: self.cfg.tool_timeout,
        };

        let deadline = tokio::time::Instant::now() + self.cfg.run_timeout;

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamEnd::Failed(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(run_id = %run.run_id, "run deadline expired before the stream opened");
                return StreamEnd::Failed(Error::Timeout);
            }
            res = self.transport.open(request, token.clone()) => match res {
                Ok(stream) => stream,
                Err(err) => return StreamEnd::Failed(err.into()),
            }
        };

        let mut tool_rows: HashMap<String, String> = HashMap::new();
        let mut thinking_hinted = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamEnd::Failed(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(run_id = %run.run_id, "run deadline expired mid-stream");
                    return StreamEnd::Failed(Error::Timeout);
                }
                item = stream.next() => item,
            };

            match item {
                None => {
                    return StreamEnd::Failed(Error::Provider(
                        crate::api::ProviderError::Stream {
                            model: run.model.clone(),
                            details: "stream ended without a result".to_string(),
                        },
                    ));
                }
                Some(Err(err)) => return StreamEnd::Failed(err.into()),
                Some(Ok(StreamEvent::TextDelta { text })) => {
                    sinks.push_delta(&text);
                    sinks.flush_ui(false);
                    sinks.flush_db(false).await;
                }
                Some(Ok(StreamEvent::ThinkingDelta { text })) => {
                    if !thinking_hinted && !text.trim().is_empty() {
                        thinking_hinted = true;
                        session.send(SessionCommand::ThinkingStarted {
                            run_id: run.run_id.clone(),
                        });
                    }
                }
                Some(Ok(StreamEvent::ToolCallStart { id, name, input })) => {
                    sinks.flush_ui(true);
                    sinks.flush_db(true).await;

                    let input_text = truncate_bytes(
                        &serde_json::to_string(&input).unwrap_or_default(),
                        TOOL_INPUT_MAX_BYTES,
                    );
                    let call_id = Uuid::new_v4().to_string();
                    let upsert = self
                        .store
                        .upsert_tool_call_start(&ToolCall {
                            id: call_id.clone(),
                            run_id: run.run_id.clone(),
                            provider_tool_call_id: if id.is_empty() {
                                None
                            } else {
                                Some(id.clone())
                            },
                            name: name.clone(),
                            status: ToolCallStatus::Running,
                            input_json: Some(input_text.clone()),
                            output_json: None,
                            error_text: None,
                            started_at: Utc::now(),
                            finished_at: None,
                        })
                        .await;
                    match upsert {
                        Ok(()) => {
                            if !id.is_empty() {
                                tool_rows.insert(id, call_id.clone());
                            }
                        }
                        Err(err) => {
                            warn!(run_id = %run.run_id, error = %err, "failed to persist tool call start")
                        }
                    }

                    session.send(SessionCommand::AddToolCall {
                        run_id: run.run_id.clone(),
                        assistant_id: run.assistant_message_id.clone(),
                        call: ToolCallView {
                            id: call_id,
                            name,
                            status: ToolCallStatus::Running,
                            input: truncate_bytes(&input_text, TOOL_PREVIEW_BYTES),
                            output: String::new(),
                            error_text: String::new(),
                        },
                    });
                }
                Some(Ok(StreamEvent::ToolCallResult {
                    id,
                    name,
                    content,
                    error: tool_error,
                })) => {
                    sinks.flush_ui(true);
                    sinks.flush_db(true).await;

                    // A result whose start event was missed still gets a row.
                    let call_id = tool_rows
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    let status = if tool_error.is_some() {
                        ToolCallStatus::Error
                    } else {
                        ToolCallStatus::Completed
                    };
                    let output_text =
                        truncate_bytes(&content_blocks_to_text(&content), TOOL_OUTPUT_MAX_BYTES);
                    let error_text = truncate_bytes(
                        tool_error.as_deref().unwrap_or(""),
                        TOOL_ERROR_MAX_BYTES,
                    );
                    if let Err(err) = self
                        .store
                        .complete_tool_call(&call_id, status, &output_text, &error_text, Utc::now())
                        .await
                    {
                        warn!(run_id = %run.run_id, tool = %name, error = %err, "failed to persist tool call result");
                    }

                    session.send(SessionCommand::UpdateToolCall {
                        run_id: run.run_id.clone(),
                        assistant_id: run.assistant_message_id.clone(),
                        call_id,
                        status,
                        output: truncate_bytes(&output_text, TOOL_PREVIEW_BYTES),
                        error_text: truncate_bytes(&error_text, TOOL_ERROR_PREVIEW_BYTES),
                    });
                }
                Some(Ok(StreamEvent::Completed { outcome })) => {
                    return StreamEnd::Completed(outcome);
                }
            }
        }
    }

    /// Compute the terminal status, write the final assistant content and the
    /// run completion, and emit the terminal patch. Store failures here are
    /// logged; the session still transitions.
    async fn finalize(
        &self,
        run: &PendingRun,
        session: &SessionHandle,
        mut sinks: StreamSinks<'_>,
        end: StreamEnd,
    ) -> RunReport {
        sinks.flush_ui(true);
        sinks.flush_db(true).await;
        let final_content = sinks.into_content();

        let mut outcome = StreamOutcome::default();
        let (status, mut error_text) = match end {
            StreamEnd::Completed(o) => {
                let failed = o.stop_reason == "error";
                outcome = o;
                if failed {
                    (RunStatus::Error, String::new())
                } else {
                    (RunStatus::Completed, String::new())
                }
            }
            // Both user stop and deadline expiry converge to `cancelled`;
            // neither populates error_text.
            StreamEnd::Failed(Error::Timeout) => (RunStatus::Cancelled, String::new()),
            StreamEnd::Failed(err) if err.is_cancellation() => {
                (RunStatus::Cancelled, String::new())
            }
            StreamEnd::Failed(err) => (RunStatus::Error, err.to_string()),
        };
        if status == RunStatus::Error && error_text.trim().is_empty() {
            error_text = format!(
                "Model {} failed without a provider error message.",
                run.model
            );
        }

        let now = Utc::now();
        if let Err(err) = self
            .store
            .update_message_content(
                &run.assistant_message_id,
                &final_content,
                status.message_status(),
                now,
            )
            .await
        {
            error!(run_id = %run.run_id, error = %err, "failed to finalize assistant message");
        }
        if let Err(err) = self
            .store
            .complete_run(
                &run.run_id,
                status,
                &outcome.stop_reason,
                &error_text,
                outcome.tool_call_count,
                outcome.turn_count,
                &outcome.usage,
                now,
            )
            .await
        {
            error!(run_id = %run.run_id, error = %err, "failed to finalize run row");
        }
        if let Err(err) = self.store.touch_chat(&run.chat_id, now).await {
            warn!(run_id = %run.run_id, error = %err, "failed to touch chat after run");
        }

        debug!(
            run_id = %run.run_id,
            status = status.as_str(),
            stop_reason = %outcome.stop_reason,
            tool_calls = outcome.tool_call_count,
            "run finalized"
        );

        session.send(SessionCommand::RunFinished {
            run_id: run.run_id.clone(),
            assistant_id: run.assistant_message_id.clone(),
            status: status.message_status(),
            error_text: error_text.clone(),
        });

        RunReport { status, error_text }
    }
}

/// Paces the two consumers of streamed text. The UI sink coalesces deltas
/// into ~30 Hz patches; the DB sink writes the full accumulated content at a
/// coarser cadence. Neither sink ever blocks the other.
struct StreamSinks<'a> {
    store: &'a Store,
    session: &'a SessionHandle,
    run_id: &'a str,
    assistant_id: &'a str,
    ui_flush_interval: Duration,
    ui_flush_bytes: usize,
    db_flush_interval: Duration,
    accumulated: String,
    pending: String,
    last_ui_flush: Instant,
    last_db_flush: Instant,
}

impl<'a> StreamSinks<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        store: &'a Store,
        session: &'a SessionHandle,
        run_id: &'a str,
        assistant_id: &'a str,
        ui_flush_interval: Duration,
        ui_flush_bytes: usize,
        db_flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            session,
            run_id,
            assistant_id,
            ui_flush_interval,
            ui_flush_bytes,
            db_flush_interval,
            accumulated: String::new(),
            pending: String::new(),
            last_ui_flush: Instant::now(),
            last_db_flush: Instant::now(),
        }
    }

    fn push_delta(&mut self, delta: &str) {
        self.pending.push_str(delta);
    }

    fn flush_ui(&mut self, force: bool) {
        if self.pending.is_empty() {
            return;
        }
        if !should_flush_ui(
            self.pending.len(),
            self.last_ui_flush.elapsed(),
            force,
            self.ui_flush_bytes,
            self.ui_flush_interval,
        ) {
            return;
        }
        let chunk = std::mem::take(&mut self.pending);
        self.accumulated.push_str(&chunk);
        self.last_ui_flush = Instant::now();
        self.session.send(SessionCommand::AppendChunk {
            run_id: self.run_id.to_string(),
            assistant_id: self.assistant_id.to_string(),
            chunk,
        });
    }

    async fn flush_db(&mut self, force: bool) {
        if !force && self.last_db_flush.elapsed() < self.db_flush_interval {
            return;
        }
        self.last_db_flush = Instant::now();
        let content = format!("{}{}", self.accumulated, self.pending);
        if let Err(err) = self
            .store
            .update_message_content(
                self.assistant_id,
                &content,
                MessageStatus::Streaming,
                Utc::now(),
            )
            .await
        {
            warn!(run_id = %self.run_id, error = %err, "failed to flush partial assistant content");
        }
    }

    /// The authoritative assistant content. Call after a forced UI flush so
    /// nothing is left pending.
    fn into_content(self) -> String {
        format!("{}{}", self.accumulated, self.pending)
    }
}

fn should_flush_ui(
    pending_len: usize,
    since_last: Duration,
    force: bool,
    flush_bytes: usize,
    flush_interval: Duration,
) -> bool {
    force || pending_len >= flush_bytes || since_last >= flush_interval
}
