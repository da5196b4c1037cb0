//! Database row types. These map directly to SQLite rows and are converted
//! into jobtalk-types models at the edge of this crate.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use jobtalk_types::models::{
    ApplicationLink, ApplicationStatus, Conversation, HireRequest, LastMessage, Message,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by hand in sqlite3 use its "YYYY-MM-DD HH:MM:SS" format.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

/// Current time at the precision the store keeps.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Corrupt {} '{}'", what, raw))
}

pub struct ConversationRow {
    pub id: String,
    pub job_id: String,
    pub jobseeker_id: String,
    pub employer_id: String,
    pub phone_shared_by_jobseeker: bool,
    pub phone_shared_by_employer: bool,
    pub created_at: String,
    pub last_content: Option<String>,
    pub last_sender_id: Option<String>,
    pub last_created_at: Option<String>,
    pub unread_jobseeker: u32,
    pub unread_employer: u32,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = anyhow::Error;

    fn try_from(row: ConversationRow) -> Result<Self> {
        let last_message = match (row.last_content, row.last_sender_id, row.last_created_at) {
            (Some(content), Some(sender), Some(created_at)) => Some(LastMessage {
                content,
                sender_id: parse_id(&sender, "sender_id")?,
                created_at: parse_timestamp(&created_at)?,
            }),
            _ => None,
        };

        Ok(Conversation {
            id: parse_id(&row.id, "conversation id")?,
            job_id: parse_id(&row.job_id, "job_id")?,
            jobseeker_id: parse_id(&row.jobseeker_id, "jobseeker_id")?,
            employer_id: parse_id(&row.employer_id, "employer_id")?,
            last_message,
            unread_jobseeker: row.unread_jobseeker,
            unread_employer: row.unread_employer,
            phone_shared_by_jobseeker: row.phone_shared_by_jobseeker,
            phone_shared_by_employer: row.phone_shared_by_employer,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub read: bool,
    pub client_marker: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_id(&row.id, "message id")?,
            conversation_id: parse_id(&row.conversation_id, "conversation_id")?,
            sender_id: parse_id(&row.sender_id, "sender_id")?,
            content: row.content,
            created_at: parse_timestamp(&row.created_at)?,
            read: row.read,
            client_marker: row
                .client_marker
                .as_deref()
                .map(|m| parse_id(m, "client_marker"))
                .transpose()?,
        })
    }
}

pub struct ApplicationRow {
    pub job_id: String,
    pub applicant_id: String,
    pub employer_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ApplicationRow> for ApplicationLink {
    type Error = anyhow::Error;

    fn try_from(row: ApplicationRow) -> Result<Self> {
        Ok(ApplicationLink {
            job_id: parse_id(&row.job_id, "job_id")?,
            applicant_id: parse_id(&row.applicant_id, "applicant_id")?,
            employer_id: parse_id(&row.employer_id, "employer_id")?,
            status: ApplicationStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("Corrupt application status '{}'", row.status))?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

pub struct HireRequestRow {
    pub id: String,
    pub job_id: String,
    pub employer_id: String,
    pub jobseeker_id: String,
    pub created_at: String,
}

impl TryFrom<HireRequestRow> for HireRequest {
    type Error = anyhow::Error;

    fn try_from(row: HireRequestRow) -> Result<Self> {
        Ok(HireRequest {
            id: parse_id(&row.id, "hire request id")?,
            job_id: parse_id(&row.job_id, "job_id")?,
            employer_id: parse_id(&row.employer_id, "employer_id")?,
            jobseeker_id: parse_id(&row.jobseeker_id, "jobseeker_id")?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}
