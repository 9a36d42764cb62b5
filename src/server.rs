//! JSON façade over the chat service and the session projector.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::session::{MessageView, SessionCommand, SessionView};
use crate::error::{Error, Result};
use crate::service::{ChatService, ChatSession};
use crate::store::{Chat, Message};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub session: Arc<ChatSession>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct CreateChatRequest {
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct RenameChatRequest {
    title: String,
}

#[derive(Deserialize)]
struct StartRunRequest {
    content: String,
    #[serde(default)]
    model: String,
}

#[derive(Serialize)]
struct StartRunResponse {
    run_id: String,
    user_message_id: String,
    assistant_message_id: String,
    model: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    default_model: String,
    allowed_models: Vec<String>,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn fail(err: Error) -> ApiError {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

pub fn router(service: Arc<ChatService>, session: Arc<ChatSession>) -> Router {
    let state = AppState { service, session };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/{id}/rename", post(rename_chat))
        .route("/api/chats/{id}", delete(delete_chat))
        .route("/api/chats/{id}/messages", get(list_messages))
        .route("/api/chats/{id}/runs", post(start_run))
        .route("/api/runs/stop", post(stop_run))
        .route("/api/session", get(session_view))
        .route("/api/session/events", get(session_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load the chat list into the session view and pick an active chat, so a
/// client subscribing to the event stream starts from a coherent snapshot.
pub async fn seed_session(service: &ChatService, session: &ChatSession) -> Result<()> {
    let chats = service.list_or_create_chats(200).await?;
    let first = chats[0].clone();
    let messages = service.list_messages(&first.id, 500).await?;

    let handle = session.handle();
    handle.send(SessionCommand::SetChats(chats));
    handle.send(SessionCommand::SetActiveChat(first.id.clone()));
    if service.is_allowed_model(&first.model) {
        handle.send(SessionCommand::SetSelectedModel(first.model));
    }
    handle.send(SessionCommand::SetMessages(
        messages.into_iter().map(MessageView::from).collect(),
    ));
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        default_model: state.service.default_model().to_string(),
        allowed_models: state
            .service
            .allowed_models()
            .iter()
            .map(|m| m.to_string())
            .collect(),
    })
}

async fn list_chats(State(state): State<AppState>) -> ApiResult<Vec<Chat>> {
    let chats = state
        .service
        .list_or_create_chats(200)
        .await
        .map_err(fail)?;
    state
        .session
        .handle()
        .send(SessionCommand::SetChats(chats.clone()));
    Ok(Json(chats))
}

async fn create_chat(
    State(state): State<AppState>,
    Json(request): Json<CreateChatRequest>,
) -> ApiResult<Chat> {
    let chat = state.service.create_chat(&request.model).await.map_err(fail)?;
    let chats = state
        .service
        .list_or_create_chats(200)
        .await
        .map_err(fail)?;
    let handle = state.session.handle();
    handle.send(SessionCommand::SetChats(chats));
    handle.send(SessionCommand::SetActiveChat(chat.id.clone()));
    handle.send(SessionCommand::SetSelectedModel(chat.model.clone()));
    handle.send(SessionCommand::SetMessages(Vec::new()));
    Ok(Json(chat))
}

async fn rename_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<RenameChatRequest>,
) -> ApiResult<Vec<Chat>> {
    state
        .service
        .rename_chat(&chat_id, &request.title)
        .await
        .map_err(fail)?;
    let chats = state
        .service
        .list_or_create_chats(200)
        .await
        .map_err(fail)?;
    state
        .session
        .handle()
        .send(SessionCommand::SetChats(chats.clone()));
    Ok(Json(chats))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Vec<Chat>> {
    state.service.delete_chat(&chat_id).await.map_err(fail)?;
    let chats = state
        .service
        .list_or_create_chats(200)
        .await
        .map_err(fail)?;
    let handle = state.session.handle();
    handle.send(SessionCommand::SetChats(chats.clone()));
    let view = state.session.handle().snapshot().await;
    if view.active_chat_id == chat_id {
        if let Some(first) = chats.first() {
            handle.send(SessionCommand::SetActiveChat(first.id.clone()));
            handle.send(SessionCommand::SetMessages(Vec::new()));
        }
    }
    Ok(Json(chats))
}

/// Returns the chat's messages and points the session view at this chat.
async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Vec<Message>> {
    let chat = state.service.store().get_chat(&chat_id).await.map_err(fail)?;
    let messages = state
        .service
        .list_messages(&chat_id, 500)
        .await
        .map_err(fail)?;

    let handle = state.session.handle();
    handle.send(SessionCommand::SetActiveChat(chat_id));
    if state.service.is_allowed_model(&chat.model) {
        handle.send(SessionCommand::SetSelectedModel(chat.model));
    }
    handle.send(SessionCommand::SetMessages(
        messages.iter().cloned().map(MessageView::from).collect(),
    ));
    Ok(Json(messages))
}

async fn start_run(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<StartRunResponse> {
    let run = state
        .service
        .start_run(&state.session, &chat_id, &request.content, &request.model)
        .await
        .map_err(fail)?;
    Ok(Json(StartRunResponse {
        run_id: run.run_id,
        user_message_id: run.user_message_id,
        assistant_message_id: run.assistant_message_id,
        model: run.model,
    }))
}

async fn stop_run(State(state): State<AppState>) -> StatusCode {
    state.service.stop_run(&state.session);
    StatusCode::NO_CONTENT
}

async fn session_view(State(state): State<AppState>) -> Json<SessionView> {
    Json(state.session.handle().snapshot().await)
}

/// SSE stream of serialized view snapshots, one per applied mutation.
async fn session_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let receiver = state.session.handle().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(view) => Some(Event::default().json_data(&view)),
            // A lagged receiver just skips to the next snapshot.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
