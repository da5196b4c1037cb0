//! Where conversations, messages and permission facts come from.
//!
//! [`LocalBackend`](local::LocalBackend) talks to an in-process database and
//! feed; [`RemoteBackend`](remote::RemoteBackend) talks to a jobtalk server
//! over REST and the WebSocket gateway. The coordinator only sees this trait.

pub mod local;
pub mod remote;

use std::future::Future;

use futures_util::stream::BoxStream;
use uuid::Uuid;

use jobtalk_types::events::MessageInsert;
use jobtalk_types::models::{ApplicationStatus, Conversation, ConversationSummary, Message};

use crate::error::SyncError;

/// Live inserts for one conversation, from the moment of subscription.
/// The stream ends when the underlying connection is lost.
pub type FeedStream = BoxStream<'static, MessageInsert>;

/// A message write. `client_marker` makes the write idempotent: replaying
/// it returns the already persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub client_marker: Uuid,
}

pub trait Backend: Send + Sync + 'static {
    /// Summaries of every conversation `user_id` takes part in, unsorted.
    fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, SyncError>> + Send;

    fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> impl Future<Output = Result<Option<Conversation>, SyncError>> + Send;

    /// Full history, ascending by `(created_at, id)`.
    fn fetch_history(&self, conversation_id: Uuid) -> impl Future<Output = Result<Vec<Message>, SyncError>> + Send;

    /// Subscribe to inserts. Once this resolves, every later insert into the
    /// conversation is delivered on the returned stream.
    fn subscribe(&self, conversation_id: Uuid) -> impl Future<Output = Result<FeedStream, SyncError>> + Send;

    fn send_message(&self, message: OutgoingMessage) -> impl Future<Output = Result<Message, SyncError>> + Send;

    fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> impl Future<Output = Result<(), SyncError>> + Send;

    fn share_phone(&self, conversation_id: Uuid, sharer_id: Uuid) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Status of `applicant_id`'s application to `job_id`, if any.
    fn application_status(
        &self,
        job_id: Uuid,
        applicant_id: Uuid,
    ) -> impl Future<Output = Result<Option<ApplicationStatus>, SyncError>> + Send;

    fn hire_request_exists(
        &self,
        employer_id: Uuid,
        jobseeker_id: Uuid,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send;
}
