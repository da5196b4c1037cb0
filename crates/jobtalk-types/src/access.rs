//! Communication permissions.
//!
//! Every role/state combination goes through [`decide`], so the client-side
//! gate and the server handlers cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ApplicationStatus, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub actor_id: Uuid,
    pub role: Role,
    pub job_id: Uuid,
    pub counterparty_id: Uuid,
}

/// What the store knows about the actor's relationship to the counterparty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFacts {
    /// The actor's own application to the job (jobseekers only).
    pub application: Option<ApplicationStatus>,
    /// Whether the actor has sent a hire request to the counterparty (employers only).
    pub hire_request_sent: bool,
    /// Set when the facts could not be loaded.
    pub unverified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoApplication,
    ApplicationRejected,
    NoHireRequest,
    Unverified,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoApplication => "you have not applied to this job",
            Self::ApplicationRejected => "your application to this job was rejected",
            Self::NoHireRequest => "no hire request has been sent to this candidate",
            Self::Unverified => "permission could not be verified right now",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(*reason),
        }
    }
}

/// Decide whether `request.actor_id` may message `request.counterparty_id`.
pub fn decide(request: &CapabilityRequest, facts: &AccessFacts) -> Decision {
    if facts.unverified {
        return Decision::Deny(DenyReason::Unverified);
    }

    match request.role {
        Role::Jobseeker => match facts.application {
            Some(ApplicationStatus::Applied | ApplicationStatus::Accepted) => Decision::Allow,
            Some(ApplicationStatus::Rejected) => Decision::Deny(DenyReason::ApplicationRejected),
            None => Decision::Deny(DenyReason::NoApplication),
        },
        Role::Employer => {
            if facts.hire_request_sent {
                Decision::Allow
            } else {
                Decision::Deny(DenyReason::NoHireRequest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(role: Role) -> CapabilityRequest {
        CapabilityRequest {
            actor_id: Uuid::new_v4(),
            role,
            job_id: Uuid::new_v4(),
            counterparty_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn jobseeker_needs_live_application() {
        let req = request(Role::Jobseeker);
        let cases = [
            (None, Decision::Deny(DenyReason::NoApplication)),
            (Some(ApplicationStatus::Applied), Decision::Allow),
            (Some(ApplicationStatus::Accepted), Decision::Allow),
            (Some(ApplicationStatus::Rejected), Decision::Deny(DenyReason::ApplicationRejected)),
        ];

        for (application, expected) in cases {
            let facts = AccessFacts { application, ..Default::default() };
            assert_eq!(decide(&req, &facts), expected, "application {:?}", application);
        }
    }

    #[test]
    fn jobseeker_ignores_hire_requests() {
        let facts = AccessFacts { hire_request_sent: true, ..Default::default() };
        assert_eq!(
            decide(&request(Role::Jobseeker), &facts),
            Decision::Deny(DenyReason::NoApplication)
        );
    }

    #[test]
    fn employer_needs_hire_request() {
        let req = request(Role::Employer);

        let without = AccessFacts { application: Some(ApplicationStatus::Applied), ..Default::default() };
        assert_eq!(decide(&req, &without), Decision::Deny(DenyReason::NoHireRequest));

        let with = AccessFacts { hire_request_sent: true, ..Default::default() };
        assert_eq!(decide(&req, &with), Decision::Allow);
    }

    #[test]
    fn unverified_facts_always_deny() {
        for role in [Role::Jobseeker, Role::Employer] {
            let facts = AccessFacts {
                application: Some(ApplicationStatus::Accepted),
                hire_request_sent: true,
                unverified: true,
            };
            assert_eq!(decide(&request(role), &facts), Decision::Deny(DenyReason::Unverified));
        }
    }

    #[test]
    fn decision_serializes_with_reason() {
        let json = serde_json::to_string(&Decision::Deny(DenyReason::NoHireRequest)).unwrap();
        assert_eq!(json, r#"{"decision":"deny","reason":"no_hire_request"}"#);
    }
}
