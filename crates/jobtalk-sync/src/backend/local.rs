use std::sync::Arc;

use futures_util::StreamExt;
use tracing::debug;
use uuid::Uuid;

use jobtalk_db::Database;
use jobtalk_gateway::feed::Feed;
use jobtalk_types::events::MessageInsert;
use jobtalk_types::models::{ApplicationStatus, Conversation, ConversationSummary, Message};

use super::{Backend, FeedStream, OutgoingMessage};
use crate::error::SyncError;

/// In-process backend: reads and writes the database directly and publishes
/// inserts on the shared feed.
///
/// Writes are not permission-checked here. Callers go through the
/// coordinator's gate; the HTTP API enforces the same rules for remote
/// clients.
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
    feed: Feed,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, feed: Feed) -> Self {
        Self { db, feed }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| SyncError::Backend(format!("blocking task failed: {}", e)))?
            .map_err(|e| SyncError::Backend(format!("{:#}", e)))
    }

    async fn participant_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation, SyncError> {
        self.get_conversation(conversation_id)
            .await?
            .filter(|c| c.is_participant(user_id))
            .ok_or(SyncError::NotFound)
    }
}

impl Backend for LocalBackend {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, SyncError> {
        let conversations = self.blocking(move |db| db.list_conversations(user_id)).await?;
        Ok(conversations
            .iter()
            .filter_map(|c| ConversationSummary::for_viewer(c, user_id))
            .collect())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>, SyncError> {
        self.blocking(move |db| db.get_conversation(conversation_id)).await
    }

    async fn fetch_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, SyncError> {
        self.blocking(move |db| db.get_messages(conversation_id)).await
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<FeedStream, SyncError> {
        Ok(self.feed.subscribe(conversation_id).into_stream().boxed())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, SyncError> {
        self.participant_conversation(message.conversation_id, message.sender_id)
            .await?;

        let OutgoingMessage {
            conversation_id,
            sender_id,
            content,
            client_marker,
        } = message;
        let (stored, inserted) = self
            .blocking(move |db| db.insert_message(conversation_id, sender_id, &content, Some(client_marker)))
            .await?;

        if inserted {
            self.feed.publish(MessageInsert::from(&stored));
        } else {
            debug!("Replayed write {} resolved to {}", client_marker, stored.id);
        }
        Ok(stored)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<(), SyncError> {
        self.participant_conversation(conversation_id, reader_id).await?;
        let marked = self
            .blocking(move |db| db.mark_read(conversation_id, reader_id))
            .await?;
        debug!("{} marked {} messages read in {}", reader_id, marked, conversation_id);
        Ok(())
    }

    async fn share_phone(&self, conversation_id: Uuid, sharer_id: Uuid) -> Result<(), SyncError> {
        self.participant_conversation(conversation_id, sharer_id).await?;
        self.blocking(move |db| db.set_phone_shared(conversation_id, sharer_id))
            .await?;
        Ok(())
    }

    async fn application_status(&self, job_id: Uuid, applicant_id: Uuid) -> Result<Option<ApplicationStatus>, SyncError> {
        let link = self
            .blocking(move |db| db.get_application(job_id, applicant_id))
            .await?;
        Ok(link.map(|l| l.status))
    }

    async fn hire_request_exists(&self, employer_id: Uuid, jobseeker_id: Uuid) -> Result<bool, SyncError> {
        self.blocking(move |db| db.hire_request_exists(employer_id, jobseeker_id))
            .await
    }
}
