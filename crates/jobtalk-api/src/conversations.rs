use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use jobtalk_types::api::{Claims, MarkReadResponse, OpenConversationRequest};
use jobtalk_types::models::{Conversation, ConversationSummary, Role, sort_summaries};

use crate::access::require_allowed;
use crate::error::{ApiError, run_blocking};
use crate::state::AppState;

/// Load a conversation the caller takes part in. Non-participants get
/// `NotFound` so conversation ids do not leak.
pub async fn load_for_participant(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Conversation, ApiError> {
    let db = state.db.clone();
    let conversation = run_blocking(move || db.get_conversation(conversation_id)).await?;

    match conversation {
        Some(conversation) if conversation.is_participant(user_id) => Ok(conversation),
        _ => Err(ApiError::NotFound),
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let conversations = run_blocking(move || db.list_conversations(user_id)).await?;

    let mut summaries: Vec<ConversationSummary> = conversations
        .iter()
        .filter_map(|c| ConversationSummary::for_viewer(c, user_id))
        .collect();
    sort_summaries(&mut summaries);

    Ok(Json(summaries))
}

pub async fn open_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.counterparty_id == claims.sub {
        return Err(ApiError::BadRequest("cannot open a conversation with yourself"));
    }

    require_allowed(&state, &claims, req.job_id, req.counterparty_id).await?;

    let (jobseeker_id, employer_id) = match claims.role {
        Role::Jobseeker => (claims.sub, req.counterparty_id),
        Role::Employer => (req.counterparty_id, claims.sub),
    };

    let db = state.db.clone();
    let job_id = req.job_id;
    let conversation =
        run_blocking(move || db.upsert_conversation(job_id, jobseeker_id, employer_id)).await?;

    info!("{} opened conversation {} for job {}", claims.sub, conversation.id, job_id);
    Ok((StatusCode::OK, Json(conversation)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = load_for_participant(&state, conversation_id, claims.sub).await?;
    Ok(Json(conversation))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    load_for_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let reader = claims.sub;
    let marked = run_blocking(move || db.mark_read(conversation_id, reader)).await?;

    Ok(Json(MarkReadResponse { marked }))
}

/// Share the caller's phone number with the other participant. One-way:
/// there is no route that unshares.
pub async fn share_phone(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = load_for_participant(&state, conversation_id, claims.sub).await?;
    let counterparty = conversation
        .counterparty(claims.sub)
        .ok_or(ApiError::NotFound)?;

    require_allowed(&state, &claims, conversation.job_id, counterparty).await?;

    let db = state.db.clone();
    let sharer = claims.sub;
    let conversation = run_blocking(move || {
        db.set_phone_shared(conversation_id, sharer)?;
        db.get_conversation(conversation_id)
    })
    .await?
    .ok_or(ApiError::NotFound)?;

    info!("{} shared phone in conversation {}", sharer, conversation_id);
    Ok(Json(conversation))
}
