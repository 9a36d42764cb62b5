//! Integration tests for the persistence layer.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use common::open_test_store;
use rhone_chat::store::{
    Message, MessageStatus, Role, Run, RunStatus, ToolCall, ToolCallStatus,
};

fn message(id: &str, chat_id: &str, role: Role, content: &str) -> Message {
    let now = Utc::now();
    Message {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        role,
        content: content.to_string(),
        status: MessageStatus::Complete,
        created_at: now,
        updated_at: now,
    }
}

fn run_row(id: &str, chat_id: &str, user_id: &str, assistant_id: &str) -> Run {
    Run {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        user_message_id: user_id.to_string(),
        assistant_message_id: assistant_id.to_string(),
        model: "oai-resp/gpt-5-mini".to_string(),
        status: RunStatus::Running,
        stop_reason: None,
        error_text: None,
        tool_call_count: 0,
        turn_count: 0,
        usage_json: None,
        started_at: Utc::now(),
        finished_at: None,
    }
}

#[tokio::test]
async fn create_and_get_chat_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    let created = store
        .create_chat("chat-1", "First chat", "oai-resp/gpt-5-mini", now)
        .await
        .unwrap();
    let fetched = store.get_chat(&created.id).await.unwrap();

    assert_eq!(fetched.id, "chat-1");
    assert_eq!(fetched.title, "First chat");
    assert_eq!(fetched.model, "oai-resp/gpt-5-mini");
}

#[tokio::test]
async fn get_missing_chat_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;

    let err = store.get_chat("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn rename_missing_chat_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;

    let err = store
        .rename_chat("missing", "Title", Utc::now())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn chats_list_most_recently_updated_first() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let base = Utc::now();

    store.create_chat("chat-a", "A", "m", base).await.unwrap();
    store.create_chat("chat-b", "B", "m", base).await.unwrap();
    store
        .touch_chat("chat-a", base + ChronoDuration::seconds(5))
        .await
        .unwrap();

    let chats = store.list_chats(10).await.unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, "chat-a");
    assert_eq!(chats[1].id, "chat-b");
}

#[tokio::test]
async fn messages_list_in_chronological_order() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let base = Utc::now();

    store.create_chat("chat-1", "C", "m", base).await.unwrap();
    let mut first = message("msg-1", "chat-1", Role::User, "first");
    first.created_at = base;
    let mut second = message("msg-2", "chat-1", Role::Assistant, "second");
    second.created_at = base + ChronoDuration::seconds(1);
    // Insert newest first to prove ordering comes from the query.
    store.insert_message(&second).await.unwrap();
    store.insert_message(&first).await.unwrap();

    let messages = store.list_messages("chat-1", 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "msg-1");
    assert_eq!(messages[1].id, "msg-2");
}

#[tokio::test]
async fn update_message_content_is_full_replace() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("msg-1", "chat-1", Role::Assistant, "Hel"))
        .await
        .unwrap();
    store
        .update_message_content("msg-1", "Hello", MessageStatus::Complete, Utc::now())
        .await
        .unwrap();

    let fetched = store.get_message("msg-1").await.unwrap();
    assert_eq!(fetched.content, "Hello");
    assert_eq!(fetched.status, MessageStatus::Complete);
}

#[tokio::test]
async fn upsert_run_start_twice_yields_one_row_with_same_state() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, ""))
        .await
        .unwrap();

    let run = run_row("run-1", "chat-1", "u-1", "a-1");
    store.upsert_run_start(&run).await.unwrap();
    store.upsert_run_start(&run).await.unwrap();

    let fetched = store.get_run("run-1").await.unwrap();
    assert_eq!(fetched.status, RunStatus::Running);
    assert_eq!(fetched.chat_id, "chat-1");
    assert_eq!(fetched.assistant_message_id, "a-1");
    assert!(fetched.finished_at.is_none());
}

#[tokio::test]
async fn run_start_retry_keeps_higher_counters() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, ""))
        .await
        .unwrap();

    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();
    store
        .complete_run(
            "run-1",
            RunStatus::Completed,
            "end_turn",
            "",
            3,
            2,
            &serde_json::json!({}),
            Utc::now(),
        )
        .await
        .unwrap();

    // A duplicated start carries zero counters; the higher values survive.
    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();

    let fetched = store.get_run("run-1").await.unwrap();
    assert_eq!(fetched.status, RunStatus::Running);
    assert_eq!(fetched.tool_call_count, 3);
    assert_eq!(fetched.turn_count, 2);
}

#[tokio::test]
async fn complete_run_sets_terminal_state_and_finished_at() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, ""))
        .await
        .unwrap();
    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();

    store
        .complete_run(
            "run-1",
            RunStatus::Completed,
            "end_turn",
            "",
            1,
            1,
            &serde_json::json!({"input_tokens": 12}),
            Utc::now(),
        )
        .await
        .unwrap();

    let fetched = store.get_run("run-1").await.unwrap();
    assert!(fetched.status.is_terminal());
    assert!(fetched.finished_at.is_some());
    assert_eq!(fetched.stop_reason.as_deref(), Some("end_turn"));
    assert!(fetched.usage_json.unwrap().contains("input_tokens"));
}

#[tokio::test]
async fn upsert_tool_call_start_twice_yields_one_row() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, ""))
        .await
        .unwrap();
    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();

    let call = ToolCall {
        id: "call-1".to_string(),
        run_id: "run-1".to_string(),
        provider_tool_call_id: Some("p1".to_string()),
        name: "web_search".to_string(),
        status: ToolCallStatus::Running,
        input_json: Some("{\"q\":\"x\"}".to_string()),
        output_json: None,
        error_text: None,
        started_at: Utc::now(),
        finished_at: None,
    };
    store.upsert_tool_call_start(&call).await.unwrap();
    store.upsert_tool_call_start(&call).await.unwrap();

    let calls = store.list_tool_calls("run-1").await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].provider_tool_call_id.as_deref(), Some("p1"));
}

#[tokio::test]
async fn deleting_a_chat_cascades_to_all_dependents() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, "hello"))
        .await
        .unwrap();
    store
        .insert_message(&message("u-2", "chat-1", Role::User, "more"))
        .await
        .unwrap();
    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();
    for call_id in ["call-1", "call-2"] {
        store
            .upsert_tool_call_start(&ToolCall {
                id: call_id.to_string(),
                run_id: "run-1".to_string(),
                provider_tool_call_id: None,
                name: "web_search".to_string(),
                status: ToolCallStatus::Running,
                input_json: None,
                output_json: None,
                error_text: None,
                started_at: Utc::now(),
                finished_at: None,
            })
            .await
            .unwrap();
    }

    store.delete_chat("chat-1").await.unwrap();

    assert!(store.get_chat("chat-1").await.unwrap_err().is_not_found());
    assert!(store.get_run("run-1").await.unwrap_err().is_not_found());
    assert!(store.list_messages("chat-1", 10).await.unwrap().is_empty());
    assert!(store.list_tool_calls("run-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn one_run_per_assistant_message() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir).await;
    let now = Utc::now();

    store.create_chat("chat-1", "C", "m", now).await.unwrap();
    store
        .insert_message(&message("u-1", "chat-1", Role::User, "hi"))
        .await
        .unwrap();
    store
        .insert_message(&message("a-1", "chat-1", Role::Assistant, ""))
        .await
        .unwrap();

    store
        .upsert_run_start(&run_row("run-1", "chat-1", "u-1", "a-1"))
        .await
        .unwrap();
    let second = store
        .upsert_run_start(&run_row("run-2", "chat-1", "u-1", "a-1"))
        .await;
    assert!(second.is_err());
}
