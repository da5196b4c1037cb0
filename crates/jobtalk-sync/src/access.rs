use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use jobtalk_types::access::{AccessFacts, CapabilityRequest, Decision, DenyReason, decide};
use jobtalk_types::models::{Conversation, Identity, Role};

use crate::backend::Backend;
use crate::error::SyncError;

/// Role-based messaging permission, evaluated fresh on every call.
///
/// Facts come from the backend and are never cached: an application that
/// was rejected a second ago must block the very next send.
pub struct AccessGate<B: Backend> {
    backend: Arc<B>,
    identity: Identity,
}

impl<B: Backend> AccessGate<B> {
    pub fn new(backend: Arc<B>, identity: Identity) -> Self {
        Self { backend, identity }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub async fn decide(&self, request: &CapabilityRequest) -> Decision {
        let facts = self.facts(request).await;
        decide(request, &facts)
    }

    /// Whether the signed-in user may message `counterparty_id` about
    /// `job_id`, acting as `role`.
    pub async fn can_communicate(&self, job_id: Uuid, counterparty_id: Uuid, role: Role) -> bool {
        let request = CapabilityRequest {
            actor_id: self.identity.user_id,
            role,
            job_id,
            counterparty_id,
        };
        self.decide(&request).await.is_allowed()
    }

    /// Decision for acting inside an existing conversation.
    pub async fn decide_for_conversation(&self, conversation: &Conversation) -> Decision {
        let Some(counterparty_id) = conversation.counterparty(self.identity.user_id) else {
            return Decision::Deny(DenyReason::Unverified);
        };
        let request = CapabilityRequest {
            actor_id: self.identity.user_id,
            role: self.identity.role,
            job_id: conversation.job_id,
            counterparty_id,
        };
        self.decide(&request).await
    }

    /// A phone number is revealed to `viewer` only after the other side
    /// shared it.
    pub fn can_reveal_phone(conversation: &Conversation, viewer: Uuid) -> bool {
        conversation.can_reveal_phone(viewer)
    }

    async fn facts(&self, request: &CapabilityRequest) -> AccessFacts {
        let result = match request.role {
            Role::Jobseeker => self
                .backend
                .application_status(request.job_id, request.actor_id)
                .await
                .map(|application| AccessFacts {
                    application,
                    ..Default::default()
                }),
            Role::Employer => self
                .backend
                .hire_request_exists(request.actor_id, request.counterparty_id)
                .await
                .map(|hire_request_sent| AccessFacts {
                    hire_request_sent,
                    ..Default::default()
                }),
        };

        match result {
            Ok(facts) => facts,
            Err(SyncError::NotFound) => AccessFacts::default(),
            Err(e) => {
                warn!("Could not verify messaging permission for {}: {}", request.actor_id, e);
                AccessFacts {
                    unverified: true,
                    ..Default::default()
                }
            }
        }
    }
}
