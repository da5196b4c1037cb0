use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use jobtalk_db::Database;
use jobtalk_types::access::{AccessFacts, CapabilityRequest, Decision, decide};
use jobtalk_types::api::{AccessQuery, AccessResponse, Claims};
use jobtalk_types::models::Role;

use crate::error::{ApiError, run_blocking};
use crate::state::AppState;

/// Load the facts `decide` needs for `request` from the database.
pub fn gather_facts(db: &Database, request: &CapabilityRequest) -> anyhow::Result<AccessFacts> {
    let facts = match request.role {
        Role::Jobseeker => AccessFacts {
            application: db
                .get_application(request.job_id, request.actor_id)?
                .map(|link| link.status),
            ..Default::default()
        },
        Role::Employer => AccessFacts {
            hire_request_sent: db.hire_request_exists(request.actor_id, request.counterparty_id)?,
            ..Default::default()
        },
    };
    Ok(facts)
}

/// Decide on behalf of the caller whether they may message `counterparty_id` about `job_id`.
pub async fn decide_for(
    state: &AppState,
    claims: &Claims,
    job_id: Uuid,
    counterparty_id: Uuid,
) -> Result<Decision, ApiError> {
    let request = CapabilityRequest {
        actor_id: claims.sub,
        role: claims.role,
        job_id,
        counterparty_id,
    };

    let db = state.db.clone();
    let facts = run_blocking(move || gather_facts(&db, &request)).await?;
    Ok(decide(&request, &facts))
}

/// Fails with `Blocked` unless the caller may message `counterparty_id`.
pub async fn require_allowed(
    state: &AppState,
    claims: &Claims,
    job_id: Uuid,
    counterparty_id: Uuid,
) -> Result<(), ApiError> {
    match decide_for(state, claims, job_id, counterparty_id).await? {
        Decision::Allow => Ok(()),
        Decision::Deny(reason) => Err(ApiError::Blocked(reason)),
    }
}

pub async fn check_access(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<AccessQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = decide_for(&state, &claims, query.job_id, query.counterparty_id).await?;

    Ok(Json(AccessResponse {
        allowed: decision.is_allowed(),
        reason: decision.reason(),
    }))
}
