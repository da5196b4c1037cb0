use anyhow::{Result, bail};
use chrono::Duration;
use rusqlite::{Connection, Row};
use uuid::Uuid;

use jobtalk_types::models::{
    ApplicationLink, ApplicationStatus, Conversation, HireRequest, Message,
};

use crate::Database;
use crate::models::{
    ApplicationRow, ConversationRow, HireRequestRow, MessageRow, format_timestamp, now_micros,
    parse_timestamp,
};

/// Conversation columns plus the derived last-message snapshot and unread
/// counts. Derived values are computed on every read, never stored, so they
/// cannot go stale relative to the messages table.
const CONVERSATION_SELECT: &str = "
    SELECT c.id, c.job_id, c.jobseeker_id, c.employer_id,
           c.phone_shared_by_jobseeker, c.phone_shared_by_employer, c.created_at,
           lm.content, lm.sender_id, lm.created_at,
           (SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = c.id AND m.read = 0 AND m.sender_id != c.jobseeker_id),
           (SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = c.id AND m.read = 0 AND m.sender_id != c.employer_id)
    FROM conversations c
    LEFT JOIN messages lm ON lm.id = (
        SELECT m.id FROM messages m
        WHERE m.conversation_id = c.id
        ORDER BY m.created_at DESC, m.id DESC
        LIMIT 1
    )";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, created_at, read, client_marker";

impl Database {
    // -- Conversations --

    /// Create the conversation for this (job, jobseeker, employer) triple, or
    /// return the existing one.
    pub fn upsert_conversation(
        &self,
        job_id: Uuid,
        jobseeker_id: Uuid,
        employer_id: Uuid,
    ) -> Result<Conversation> {
        let id = self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, job_id, jobseeker_id, employer_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id, jobseeker_id, employer_id) DO NOTHING",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    job_id.to_string(),
                    jobseeker_id.to_string(),
                    employer_id.to_string(),
                    format_timestamp(now_micros()),
                ],
            )?;

            let id: String = conn.query_row(
                "SELECT id FROM conversations
                 WHERE job_id = ?1 AND jobseeker_id = ?2 AND employer_id = ?3",
                rusqlite::params![
                    job_id.to_string(),
                    jobseeker_id.to_string(),
                    employer_id.to_string()
                ],
                |row| row.get(0),
            )?;
            Ok(id)
        })?;

        match self.get_conversation(id.parse()?)? {
            Some(conversation) => Ok(conversation),
            None => bail!("Conversation {} vanished after upsert", id),
        }
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = self.with_conn(|conn| {
            let sql = format!("{} WHERE c.id = ?1", CONVERSATION_SELECT);
            conn.query_row(&sql, [id.to_string()], conversation_row).optional()
        })?;

        row.map(Conversation::try_from).transpose()
    }

    /// All conversations `user_id` takes part in, most recent activity first.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE c.jobseeker_id = ?1 OR c.employer_id = ?1
                 ORDER BY (lm.id IS NULL), COALESCE(lm.created_at, c.created_at) DESC, c.id",
                CONVERSATION_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], conversation_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    /// Set the sharer's phone-shared flag. The flag only ever goes from 0 to 1.
    /// Returns false if `sharer_id` is not a participant (or the conversation
    /// does not exist).
    pub fn set_phone_shared(&self, conversation_id: Uuid, sharer_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET
                    phone_shared_by_jobseeker =
                        CASE WHEN jobseeker_id = ?2 THEN 1 ELSE phone_shared_by_jobseeker END,
                    phone_shared_by_employer =
                        CASE WHEN employer_id = ?2 THEN 1 ELSE phone_shared_by_employer END
                 WHERE id = ?1 AND (jobseeker_id = ?2 OR employer_id = ?2)",
                [conversation_id.to_string(), sharer_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Persist a message. Returns the stored row and whether it was newly
    /// inserted.
    ///
    /// A `client_marker` that is already stored returns the existing row
    /// untouched, so a sender may retry a write whose response it never saw.
    /// `created_at` is assigned here and is strictly greater than every
    /// earlier message in the conversation.
    pub fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_marker: Option<Uuid>,
    ) -> Result<(Message, bool)> {
        let (row, inserted) = self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            if let Some(marker) = client_marker {
                let sql = format!("SELECT {} FROM messages WHERE client_marker = ?1", MESSAGE_COLUMNS);
                let existing = tx
                    .query_row(&sql, [marker.to_string()], message_row)
                    .optional()?;
                if let Some(existing) = existing {
                    return Ok((existing, false));
                }
            }

            let latest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id.to_string()],
                |row| row.get(0),
            )?;

            let mut created_at = now_micros();
            if let Some(latest) = latest.as_deref().map(parse_timestamp).transpose()? {
                if latest >= created_at {
                    created_at = latest + Duration::microseconds(1);
                }
            }

            let row = MessageRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                content: content.to_string(),
                created_at: format_timestamp(created_at),
                read: false,
                client_marker: client_marker.map(|m| m.to_string()),
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, read, client_marker)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                rusqlite::params![
                    row.id,
                    row.conversation_id,
                    row.sender_id,
                    row.content,
                    row.created_at,
                    row.client_marker
                ],
            )?;
            tx.commit()?;

            Ok((row, true))
        })?;

        Ok((Message::try_from(row)?, inserted))
    }

    /// Full history of a conversation, ascending by (created_at, id).
    pub fn get_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY created_at, id",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([conversation_id.to_string()], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(Message::try_from).collect()
    }

    /// Mark every message in the conversation not sent by `reader_id` as read.
    pub fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let marked = conn.execute(
                "UPDATE messages SET read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0",
                [conversation_id.to_string(), reader_id.to_string()],
            )?;
            Ok(marked)
        })
    }

    // -- Applications --

    /// Record an application. Applying twice returns the existing link
    /// without changing its status.
    pub fn apply(&self, job_id: Uuid, applicant_id: Uuid, employer_id: Uuid) -> Result<ApplicationLink> {
        let row = self.with_conn_mut(|conn| {
            let now = format_timestamp(now_micros());
            conn.execute(
                "INSERT INTO application_links (job_id, applicant_id, employer_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'applied', ?4, ?4)
                 ON CONFLICT(job_id, applicant_id) DO NOTHING",
                rusqlite::params![
                    job_id.to_string(),
                    applicant_id.to_string(),
                    employer_id.to_string(),
                    now
                ],
            )?;
            query_application(conn, job_id, applicant_id)?
                .ok_or_else(|| anyhow::anyhow!("Application vanished after insert"))
        })?;

        ApplicationLink::try_from(row)
    }

    pub fn get_application(&self, job_id: Uuid, applicant_id: Uuid) -> Result<Option<ApplicationLink>> {
        self.with_conn(|conn| query_application(conn, job_id, applicant_id))?
            .map(ApplicationLink::try_from)
            .transpose()
    }

    /// Atomically move an application to `status`. Returns `None` if there is
    /// no such application.
    pub fn update_application_status(
        &self,
        job_id: Uuid,
        applicant_id: Uuid,
        status: ApplicationStatus,
    ) -> Result<Option<ApplicationLink>> {
        let row = self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE application_links SET status = ?3, updated_at = ?4
                 WHERE job_id = ?1 AND applicant_id = ?2",
                rusqlite::params![
                    job_id.to_string(),
                    applicant_id.to_string(),
                    status.as_str(),
                    format_timestamp(now_micros())
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_application(conn, job_id, applicant_id)
        })?;

        row.map(ApplicationLink::try_from).transpose()
    }

    // -- Hire requests --

    pub fn create_hire_request(
        &self,
        job_id: Uuid,
        employer_id: Uuid,
        jobseeker_id: Uuid,
    ) -> Result<HireRequest> {
        let row = self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO hire_requests (id, job_id, employer_id, jobseeker_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id, employer_id, jobseeker_id) DO NOTHING",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    job_id.to_string(),
                    employer_id.to_string(),
                    jobseeker_id.to_string(),
                    format_timestamp(now_micros())
                ],
            )?;

            let row = conn.query_row(
                "SELECT id, job_id, employer_id, jobseeker_id, created_at FROM hire_requests
                 WHERE job_id = ?1 AND employer_id = ?2 AND jobseeker_id = ?3",
                [job_id.to_string(), employer_id.to_string(), jobseeker_id.to_string()],
                |row| {
                    Ok(HireRequestRow {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        employer_id: row.get(2)?,
                        jobseeker_id: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )?;
            Ok(row)
        })?;

        HireRequest::try_from(row)
    }

    /// Whether `employer_id` has sent a hire request to `jobseeker_id` for any job.
    pub fn hire_request_exists(&self, employer_id: Uuid, jobseeker_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM hire_requests WHERE employer_id = ?1 AND jobseeker_id = ?2)",
                [employer_id.to_string(), jobseeker_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }
}

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        jobseeker_id: row.get(2)?,
        employer_id: row.get(3)?,
        phone_shared_by_jobseeker: row.get(4)?,
        phone_shared_by_employer: row.get(5)?,
        created_at: row.get(6)?,
        last_content: row.get(7)?,
        last_sender_id: row.get(8)?,
        last_created_at: row.get(9)?,
        unread_jobseeker: row.get(10)?,
        unread_employer: row.get(11)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        read: row.get(5)?,
        client_marker: row.get(6)?,
    })
}

fn query_application(conn: &Connection, job_id: Uuid, applicant_id: Uuid) -> Result<Option<ApplicationRow>> {
    conn.query_row(
        "SELECT job_id, applicant_id, employer_id, status, created_at, updated_at
         FROM application_links WHERE job_id = ?1 AND applicant_id = ?2",
        [job_id.to_string(), applicant_id.to_string()],
        |row| {
            Ok(ApplicationRow {
                job_id: row.get(0)?,
                applicant_id: row.get(1)?,
                employer_id: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        },
    )
    .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
