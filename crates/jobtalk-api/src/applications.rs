use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use jobtalk_types::api::{
    ApplyRequest, Claims, ExistsResponse, HireRequestBody, UpdateApplicationRequest,
};
use jobtalk_types::models::Role;

use crate::error::{ApiError, run_blocking};
use crate::state::AppState;

fn require_role(claims: &Claims, role: Role) -> Result<(), ApiError> {
    if claims.role == role {
        Ok(())
    } else {
        Err(ApiError::WrongRole)
    }
}

pub async fn apply(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ApplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, Role::Jobseeker)?;

    let db = state.db.clone();
    let applicant = claims.sub;
    let link = run_blocking(move || db.apply(job_id, applicant, req.employer_id)).await?;

    info!("{} applied to job {} ({})", applicant, job_id, link.status.as_str());
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn get_application(
    State(state): State<AppState>,
    Path((job_id, applicant_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let link = run_blocking(move || db.get_application(job_id, applicant_id)).await?;

    match link {
        Some(link) if link.applicant_id == claims.sub || link.employer_id == claims.sub => {
            Ok(Json(link))
        }
        _ => Err(ApiError::NotFound),
    }
}

/// Employer moves an application to a new status.
pub async fn update_status(
    State(state): State<AppState>,
    Path((job_id, applicant_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateApplicationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, Role::Employer)?;

    let db = state.db.clone();
    let existing = run_blocking(move || db.get_application(job_id, applicant_id)).await?;
    match existing {
        Some(link) if link.employer_id == claims.sub => {}
        _ => return Err(ApiError::NotFound),
    }

    let db = state.db.clone();
    let link = run_blocking(move || db.update_application_status(job_id, applicant_id, req.status))
        .await?
        .ok_or(ApiError::NotFound)?;

    info!(
        "Application of {} to job {} is now {}",
        applicant_id,
        job_id,
        link.status.as_str()
    );
    Ok(Json(link))
}

pub async fn create_hire_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<HireRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&claims, Role::Employer)?;
    if req.jobseeker_id == claims.sub {
        return Err(ApiError::BadRequest("cannot hire yourself"));
    }

    let db = state.db.clone();
    let employer = claims.sub;
    let request =
        run_blocking(move || db.create_hire_request(req.job_id, employer, req.jobseeker_id)).await?;

    info!("{} sent a hire request to {}", employer, request.jobseeker_id);
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn hire_request_exists(
    State(state): State<AppState>,
    Path(jobseeker_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let employer = claims.sub;
    let exists = run_blocking(move || db.hire_request_exists(employer, jobseeker_id)).await?;

    Ok(Json(ExistsResponse { exists }))
}
