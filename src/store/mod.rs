//! Durable record of chats, messages, runs, and tool calls.
//!
//! Writes go through a single pooled connection so the store is an effective
//! serial writer; readers share the same pool. IDs are application-generated
//! and stored as text, which is what makes the run/tool-call upserts safe to
//! retry.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};

use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chats (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  model TEXT NOT NULL,
  created_at DATETIME NOT NULL,
  updated_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  chat_id TEXT NOT NULL,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at DATETIME NOT NULL,
  updated_at DATETIME NOT NULL,
  FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_created ON messages(chat_id, created_at, id);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  chat_id TEXT NOT NULL,
  user_message_id TEXT NOT NULL,
  assistant_message_id TEXT NOT NULL,
  model TEXT NOT NULL,
  status TEXT NOT NULL,
  stop_reason TEXT,
  error_text TEXT,
  tool_call_count INTEGER NOT NULL DEFAULT 0,
  turn_count INTEGER NOT NULL DEFAULT 0,
  usage_json TEXT,
  started_at DATETIME NOT NULL,
  finished_at DATETIME,
  FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE,
  FOREIGN KEY(user_message_id) REFERENCES messages(id) ON DELETE RESTRICT,
  FOREIGN KEY(assistant_message_id) REFERENCES messages(id) ON DELETE RESTRICT
);
CREATE INDEX IF NOT EXISTS idx_runs_chat_started ON runs(chat_id, started_at, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_assistant_message ON runs(assistant_message_id);

CREATE TABLE IF NOT EXISTS tool_calls (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  tool_call_id TEXT,
  name TEXT NOT NULL,
  status TEXT NOT NULL,
  input_json TEXT,
  output_json TEXT,
  error_text TEXT,
  started_at DATETIME NOT NULL,
  finished_at DATETIME,
  FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_run_started ON tool_calls(run_id, started_at, id);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Result<Role> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(decode_error(format!("invalid message role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Streaming,
    Cancelled,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Complete => "complete",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<MessageStatus> {
        match value {
            "complete" => Ok(MessageStatus::Complete),
            "streaming" => Ok(MessageStatus::Streaming),
            "cancelled" => Ok(MessageStatus::Cancelled),
            "error" => Ok(MessageStatus::Error),
            other => Err(decode_error(format!("invalid message status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<RunStatus> {
        match value {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "error" => Ok(RunStatus::Error),
            other => Err(decode_error(format!("invalid run status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// The message status a terminal run imposes on its assistant message.
    pub fn message_status(&self) -> MessageStatus {
        match self {
            RunStatus::Running => MessageStatus::Streaming,
            RunStatus::Completed => MessageStatus::Complete,
            RunStatus::Cancelled => MessageStatus::Cancelled,
            RunStatus::Error => MessageStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Running => "running",
            ToolCallStatus::Completed => "completed",
            ToolCallStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<ToolCallStatus> {
        match value {
            "running" => Ok(ToolCallStatus::Running),
            "completed" => Ok(ToolCallStatus::Completed),
            "error" => Ok(ToolCallStatus::Error),
            other => Err(decode_error(format!("invalid tool call status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub chat_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub model: String,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub error_text: Option<String>,
    pub tool_call_count: u32,
    pub turn_count: u32,
    pub usage_json: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub run_id: String,
    pub provider_tool_call_id: Option<String>,
    pub name: String,
    pub status: ToolCallStatus,
    pub input_json: Option<String>,
    pub output_json: Option<String>,
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) a SQLite store at `path` and apply the
    /// schema. The parent directory is created as needed.
    pub async fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Store { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn list_chats(&self, limit: i64) -> Result<Vec<Chat>> {
        let limit = if limit < 1 { 100 } else { limit };
        let rows = sqlx::query(
            r#"
            SELECT id, title, model, created_at, updated_at
            FROM chats
            ORDER BY updated_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chat_from_row).collect()
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        let row = sqlx::query(
            r#"
            SELECT id, title, model, created_at, updated_at
            FROM chats
            WHERE id = ?1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => chat_from_row(&row),
            None => Err(Error::NotFound(format!("chat {chat_id}"))),
        }
    }

    pub async fn create_chat(
        &self,
        id: &str,
        title: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<Chat> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, title, model, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(model)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Chat {
            id: id.to_string(),
            title: title.to_string(),
            model: model.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(now)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("chat {chat_id}")));
        }
        Ok(())
    }

    pub async fn update_chat_model(
        &self,
        chat_id: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE chats SET model = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(model)
            .bind(now)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("chat {chat_id}")));
        }
        Ok(())
    }

    /// Delete a chat and everything under it. Children go first, in
    /// dependency order, so the RESTRICT constraints from runs onto their
    /// messages never fire mid-delete.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM tool_calls WHERE run_id IN (SELECT id FROM runs WHERE chat_id = ?1)",
        )
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM runs WHERE chat_id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("chat {chat_id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn touch_chat(&self, chat_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE chats SET updated_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_messages(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>> {
        let limit = if limit < 1 { 300 } else { limit };
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, role, content, status, created_at, updated_at
            FROM messages
            WHERE chat_id = ?1
            ORDER BY created_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message> {
        let row = sqlx::query(
            r#"
            SELECT id, chat_id, role, content, status, created_at, updated_at
            FROM messages
            WHERE id = ?1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => message_from_row(&row),
            None => Err(Error::NotFound(format!("message {message_id}"))),
        }
    }

    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_message_tx(&mut *conn, message).await
    }

    /// Full-replace update of a message's content and status.
    pub async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET content = ?1, status = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(content)
            .bind(status.as_str())
            .bind(now)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_run_start(&self, run: &Run) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_run_start_tx(&mut *conn, run).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query(
            r#"
            SELECT id, chat_id, user_message_id, assistant_message_id, model, status,
                   stop_reason, error_text, tool_call_count, turn_count, usage_json,
                   started_at, finished_at
            FROM runs
            WHERE id = ?1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => run_from_row(&row),
            None => Err(Error::NotFound(format!("run {run_id}"))),
        }
    }

    /// Finalize a run. Issued once per run; callers must not issue twice.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        stop_reason: &str,
        error_text: &str,
        tool_call_count: u32,
        turn_count: u32,
        usage: &serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let usage_json = serde_json::to_string(usage).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1, stop_reason = ?2, error_text = ?3, tool_call_count = ?4,
                turn_count = ?5, usage_json = ?6, finished_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(status.as_str())
        .bind(stop_reason)
        .bind(error_text)
        .bind(tool_call_count)
        .bind(turn_count)
        .bind(usage_json)
        .bind(finished_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_tool_call_start(&self, call: &ToolCall) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_calls (id, run_id, tool_call_id, name, status, input_json, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
              status = excluded.status,
              input_json = excluded.input_json,
              name = excluded.name,
              tool_call_id = excluded.tool_call_id
            "#,
        )
        .bind(&call.id)
        .bind(&call.run_id)
        .bind(&call.provider_tool_call_id)
        .bind(&call.name)
        .bind(call.status.as_str())
        .bind(&call.input_json)
        .bind(call.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_tool_call(
        &self,
        call_id: &str,
        status: ToolCallStatus,
        output_json: &str,
        error_text: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_calls
            SET status = ?1, output_json = ?2, error_text = ?3, finished_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(output_json)
        .bind(error_text)
        .bind(finished_at)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_tool_calls(&self, run_id: &str) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, tool_call_id, name, status, input_json, output_json,
                   error_text, started_at, finished_at
            FROM tool_calls
            WHERE run_id = ?1
            ORDER BY started_at ASC, id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tool_call_from_row).collect()
    }
}

/// Insert a message on an explicit connection, so the caller can batch it
/// inside a transaction.
pub async fn insert_message_tx(conn: &mut SqliteConnection, message: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, chat_id, role, content, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.status.as_str())
    .bind(message.created_at)
    .bind(message.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Idempotent on `id`: a retried start overwrites the mutable start fields,
/// while counters keep whichever value is higher.
pub async fn upsert_run_start_tx(conn: &mut SqliteConnection, run: &Run) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (id, chat_id, user_message_id, assistant_message_id, model, status,
                          started_at, tool_call_count, turn_count)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
          status = excluded.status,
          model = excluded.model,
          chat_id = excluded.chat_id,
          user_message_id = excluded.user_message_id,
          assistant_message_id = excluded.assistant_message_id,
          started_at = excluded.started_at,
          tool_call_count = MAX(runs.tool_call_count, excluded.tool_call_count),
          turn_count = MAX(runs.turn_count, excluded.turn_count)
        "#,
    )
    .bind(&run.id)
    .bind(&run.chat_id)
    .bind(&run.user_message_id)
    .bind(&run.assistant_message_id)
    .bind(&run.model)
    .bind(run.status.as_str())
    .bind(run.started_at)
    .bind(run.tool_call_count)
    .bind(run.turn_count)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn touch_chat_tx(
    conn: &mut SqliteConnection,
    chat_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE chats SET updated_at = ?1 WHERE id = ?2")
        .bind(at)
        .bind(chat_id)
        .execute(conn)
        .await?;
    Ok(())
}

fn chat_from_row(row: &SqliteRow) -> Result<Chat> {
    Ok(Chat {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        model: row.try_get("model")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        role: Role::parse(row.try_get::<String, _>("role")?.as_str())?,
        content: row.try_get("content")?,
        status: MessageStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    Ok(Run {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        user_message_id: row.try_get("user_message_id")?,
        assistant_message_id: row.try_get("assistant_message_id")?,
        model: row.try_get("model")?,
        status: RunStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        stop_reason: row.try_get("stop_reason")?,
        error_text: row.try_get("error_text")?,
        tool_call_count: row.try_get("tool_call_count")?,
        turn_count: row.try_get("turn_count")?,
        usage_json: row.try_get("usage_json")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn tool_call_from_row(row: &SqliteRow) -> Result<ToolCall> {
    Ok(ToolCall {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        provider_tool_call_id: row.try_get("tool_call_id")?,
        name: row.try_get("name")?,
        status: ToolCallStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        input_json: row.try_get("input_json")?,
        output_json: row.try_get("output_json")?,
        error_text: row.try_get("error_text")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn decode_error(details: String) -> Error {
    Error::Store(sqlx::Error::Decode(details.into()))
}
