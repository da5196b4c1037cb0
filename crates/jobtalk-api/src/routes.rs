use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use jobtalk_gateway::connection;

use crate::auth::decode_token;
use crate::error::ApiError;
use crate::middleware::{bearer_token, require_auth};
use crate::state::AppState;
use crate::{access, applications, conversations, messages};

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::open_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route("/conversations/{conversation_id}/phone", post(conversations::share_phone))
        .route("/access", get(access::check_access))
        .route("/jobs/{job_id}/applications", post(applications::apply))
        .route(
            "/jobs/{job_id}/applications/{applicant_id}",
            get(applications::get_application).put(applications::update_status),
        )
        .route("/hire-requests", post(applications::create_hire_request))
        .route("/hire-requests/{jobseeker_id}", get(applications::hire_request_exists))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(gateway_upgrade))
        .with_state(state);

    Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Authenticate at the HTTP upgrade so the socket loop never sees an
/// unauthenticated client. Browsers cannot set headers on WebSocket
/// requests, so the token may also come as `?token=`.
async fn gateway_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(ApiError::Unauthorized)?;
    let claims = decode_token(&state.jwt_secret, token).map_err(|_| ApiError::Unauthorized)?;

    let feed = state.feed.clone();
    let db = state.db.clone();
    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, feed, db, claims.sub)))
}
