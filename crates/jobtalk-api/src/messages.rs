use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, warn};
use uuid::Uuid;

use jobtalk_types::api::{Claims, SendMessageRequest};
use jobtalk_types::events::MessageInsert;

use crate::access::require_allowed;
use crate::conversations::load_for_participant;
use crate::error::{ApiError, run_blocking};
use crate::state::AppState;

const MAX_CONTENT_CHARS: usize = 4000;

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("message is empty"));
    }
    if req.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::BadRequest("message is too long"));
    }

    let conversation = load_for_participant(&state, conversation_id, claims.sub).await?;
    let counterparty = conversation
        .counterparty(claims.sub)
        .ok_or(ApiError::NotFound)?;

    require_allowed(&state, &claims, conversation.job_id, counterparty).await?;

    let db = state.db.clone();
    let sender = claims.sub;
    let marker = req.client_marker;
    let (message, inserted) =
        run_blocking(move || db.insert_message(conversation_id, sender, &req.content, marker)).await?;

    // A marker names one message; reusing it elsewhere is not a replay.
    if message.conversation_id != conversation_id || message.sender_id != sender {
        warn!("Marker {:?} from {} already names message {}", marker, sender, message.id);
        return Err(ApiError::Conflict("client marker belongs to another message"));
    }

    if inserted {
        state.feed.publish(MessageInsert::from(&message));
        Ok((StatusCode::CREATED, Json(message)))
    } else {
        debug!("Replayed send for marker {:?} resolved to {}", marker, message.id);
        Ok((StatusCode::OK, Json(message)))
    }
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    load_for_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let messages = run_blocking(move || db.get_messages(conversation_id)).await?;

    Ok(Json(messages))
}
