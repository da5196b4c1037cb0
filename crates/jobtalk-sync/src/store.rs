use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use jobtalk_types::models::{ConversationSummary, sort_summaries};

use crate::backend::Backend;
use crate::backoff::with_backoff;
use crate::config::RetryPolicy;
use crate::error::SyncError;

#[derive(Debug, Default)]
struct Cached {
    summaries: Arc<Vec<ConversationSummary>>,
    refreshed_at: Option<DateTime<Utc>>,
    /// Ticket of the refresh that produced `summaries`.
    ticket: u64,
}

/// The signed-in user's conversation list, most recent activity first.
///
/// Reads never block on the network. A failed refresh keeps serving the
/// last good list.
pub struct ConversationStore<B: Backend> {
    backend: Arc<B>,
    user_id: Uuid,
    retry: RetryPolicy,
    next_ticket: AtomicU64,
    cache: RwLock<Cached>,
}

impl<B: Backend> ConversationStore<B> {
    pub fn new(backend: Arc<B>, user_id: Uuid, retry: RetryPolicy) -> Self {
        Self {
            backend,
            user_id,
            retry,
            next_ticket: AtomicU64::new(1),
            cache: RwLock::new(Cached::default()),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn list(&self) -> Arc<Vec<ConversationSummary>> {
        self.read(|cached| cached.summaries.clone())
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<ConversationSummary> {
        self.read(|cached| {
            cached
                .summaries
                .iter()
                .find(|s| s.id == conversation_id)
                .cloned()
        })
    }

    pub fn unread_total(&self) -> u32 {
        self.read(|cached| cached.summaries.iter().map(|s| s.unread).sum())
    }

    /// `None` until the first successful refresh.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.read(|cached| cached.refreshed_at)
    }

    /// Pull fresh summaries. Concurrent refreshes may finish in any order;
    /// only a newer one replaces the cache.
    pub async fn refresh(&self) -> Result<Arc<Vec<ConversationSummary>>, SyncError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let fetched = with_backoff(&self.retry, "conversation refresh", || {
            self.backend.list_conversations(self.user_id)
        })
        .await;

        let mut summaries = match fetched {
            Ok(summaries) => summaries,
            Err(SyncError::NotFound) => Vec::new(),
            Err(e) => {
                warn!(
                    "Conversation refresh failed, serving {} cached: {}",
                    self.list().len(),
                    e
                );
                return Err(e);
            }
        };
        sort_summaries(&mut summaries);
        let fresh = Arc::new(summaries);

        let mut cached = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if ticket > cached.ticket {
            cached.summaries = fresh.clone();
            cached.refreshed_at = Some(Utc::now());
            cached.ticket = ticket;
            debug!("Conversation list refreshed ({} entries)", fresh.len());
            Ok(fresh)
        } else {
            // A later refresh already landed; report what is cached.
            Ok(cached.summaries.clone())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Cached) -> T) -> T {
        let cached = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        f(&cached)
    }
}
