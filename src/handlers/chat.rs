use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::services::router;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// One conversation turn. Handler failures are already translated into
/// user-facing text inside the router, so this always answers 200 for a
/// well-formed request.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let conversation_id = request.conversation_id.trim();
    let message = request.message.trim();

    if conversation_id.is_empty() || message.is_empty() {
        let body = serde_json::json!({ "error": "conversation_id and message are required" });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
    }

    tracing::info!(conversation = conversation_id, "incoming message");

    let reply = router::handle(&state, conversation_id, message).await;
    Json(ChatResponse { reply }).into_response()
}

#[derive(Deserialize)]
pub struct EndRequest {
    pub conversation_id: String,
}

/// Explicitly end a conversation, discarding its booking session. Waits on
/// the conversation lock so an in-flight commit records its result first.
pub async fn end_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EndRequest>,
) -> Result<Response, AgentError> {
    let conversation_id = request.conversation_id.trim();
    if conversation_id.is_empty() {
        let body = serde_json::json!({ "error": "conversation_id is required" });
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response());
    }

    let _guard = state.sessions.acquire(conversation_id).await;
    let found = state.sessions.delete(conversation_id)?;
    Ok(Json(serde_json::json!({ "ended": found })).into_response())
}
