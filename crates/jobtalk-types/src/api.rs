use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::DenyReason;
use crate::models::{ApplicationStatus, Role};

// -- JWT Claims --

/// JWT claims shared by jobtalk-api (REST middleware) and jobtalk-gateway
/// (WebSocket upgrade). Tokens are minted by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenConversationRequest {
    pub job_id: Uuid,
    pub counterparty_id: Uuid,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    /// Temp id of the sender's optimistic copy; makes retries idempotent.
    #[serde(default)]
    pub client_marker: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked: usize,
}

// -- Access --

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessQuery {
    pub job_id: Uuid,
    pub counterparty_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessResponse {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

// -- Applications --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyRequest {
    pub employer_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateApplicationRequest {
    pub status: ApplicationStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HireRequestBody {
    pub job_id: Uuid,
    pub jobseeker_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

// -- Errors --

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}
