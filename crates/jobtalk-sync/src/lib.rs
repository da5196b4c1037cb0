//! Client-side conversation sync: a live, ordered, deduplicated view of each
//! open conversation, optimistic sends, and role-based messaging permissions.

pub mod access;
pub mod backend;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod store;

pub use access::AccessGate;
pub use backend::Backend;
pub use backend::local::LocalBackend;
pub use backend::remote::RemoteBackend;
pub use channel::{ChannelItem, ChannelState, ChannelView, Delivery, MessageChannel};
pub use config::{RetryPolicy, SyncConfig};
pub use coordinator::{ConversationView, SendOutcome, SyncCoordinator};
pub use error::SyncError;
pub use store::ConversationStore;
