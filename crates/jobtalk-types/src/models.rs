use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Jobseeker,
    Employer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jobseeker => "jobseeker",
            Self::Employer => "employer",
        }
    }
}

/// The signed-in user for a session. Read-only once the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    Accepted,
    Rejected,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(Self::Applied),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationLink {
    pub job_id: Uuid,
    pub applicant_id: Uuid,
    pub employer_id: Uuid,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HireRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub employer_id: Uuid,
    pub jobseeker_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A persisted message. Only `read` may change after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    /// Temp id the sender attached to its optimistic copy, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_marker: Option<Uuid>,
}

impl Message {
    /// Total order within a conversation: timestamp first, id breaks ties.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub jobseeker_id: Uuid,
    pub employer_id: Uuid,
    pub last_message: Option<LastMessage>,
    pub unread_jobseeker: u32,
    pub unread_employer: u32,
    pub phone_shared_by_jobseeker: bool,
    pub phone_shared_by_employer: bool,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.jobseeker_id == user_id || self.employer_id == user_id
    }

    /// The other participant, or `None` if `user_id` is not in this conversation.
    pub fn counterparty(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.jobseeker_id {
            Some(self.employer_id)
        } else if user_id == self.employer_id {
            Some(self.jobseeker_id)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        if user_id == self.jobseeker_id {
            self.unread_jobseeker
        } else if user_id == self.employer_id {
            self.unread_employer
        } else {
            0
        }
    }

    pub fn phone_shared_by(&self, user_id: Uuid) -> bool {
        if user_id == self.jobseeker_id {
            self.phone_shared_by_jobseeker
        } else if user_id == self.employer_id {
            self.phone_shared_by_employer
        } else {
            false
        }
    }

    /// Whether `viewer` may see the counterparty's phone number.
    pub fn can_reveal_phone(&self, viewer: Uuid) -> bool {
        self.counterparty(viewer)
            .is_some_and(|other| self.phone_shared_by(other))
    }
}

/// A conversation as seen by one of its participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub job_id: Uuid,
    pub counterparty_id: Uuid,
    pub last_message: Option<LastMessage>,
    pub unread: u32,
    pub phone_visible: bool,
    pub phone_shared: bool,
    pub created_at: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn for_viewer(conversation: &Conversation, viewer: Uuid) -> Option<Self> {
        let counterparty_id = conversation.counterparty(viewer)?;
        Some(Self {
            id: conversation.id,
            job_id: conversation.job_id,
            counterparty_id,
            last_message: conversation.last_message.clone(),
            unread: conversation.unread_for(viewer),
            phone_visible: conversation.can_reveal_phone(viewer),
            phone_shared: conversation.phone_shared_by(viewer),
            created_at: conversation.created_at,
        })
    }

    /// Timestamp conversations are listed by. Threads without messages fall
    /// back to their creation time and always rank after threads with messages.
    fn sort_key(&self) -> (bool, DateTime<Utc>) {
        match &self.last_message {
            Some(last) => (true, last.created_at),
            None => (false, self.created_at),
        }
    }
}

/// Most recent activity first; id breaks ties so the order is stable.
pub fn sort_summaries(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.sort_key()
            .cmp(&a.sort_key())
            .then_with(|| a.id.cmp(&b.id))
    });
}
