use axum::Json;
use axum::extract::{Path, State};
use duet_core::{Conversation, Message};
use uuid::Uuid;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Lists conversations, newest first.
pub async fn list_conversations(State(state): State<AppState>) -> Json<Vec<Conversation>> {
    Json(state.generator.store().conversations())
}

pub async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::not_found(format!("Conversation {id} not found")))?;
    Ok(Json(state.generator.store().messages(id)?))
}
