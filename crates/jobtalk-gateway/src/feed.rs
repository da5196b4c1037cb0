use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use jobtalk_types::events::MessageInsert;

const DEFAULT_CAPACITY: usize = 1024;

/// The live insert feed. Every persisted message is published here once;
/// subscribers see only inserts that happen after they subscribe.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    /// All inserts for all conversations; subscribers filter.
    broadcast_tx: broadcast::Sender<MessageInsert>,
}

impl Default for Feed {
    fn default() -> Self {
        Self::new()
    }
}

impl Feed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(FeedInner { broadcast_tx }),
        }
    }

    /// Publish an insert to every current subscriber.
    pub fn publish(&self, insert: MessageInsert) {
        debug!(
            conversation_id = %insert.conversation_id,
            message_id = %insert.id,
            "publishing insert"
        );
        // No receivers is fine: nobody is watching that conversation.
        let _ = self.inner.broadcast_tx.send(insert);
    }

    /// Unfiltered receiver, for connections that manage their own filter set.
    pub fn subscribe_all(&self) -> broadcast::Receiver<MessageInsert> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Subscribe to inserts for a single conversation.
    pub fn subscribe(&self, conversation_id: Uuid) -> FeedSubscription {
        FeedSubscription {
            conversation_id,
            rx: self.inner.broadcast_tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}

/// A per-conversation subscription. Dropping it unsubscribes.
pub struct FeedSubscription {
    conversation_id: Uuid,
    rx: broadcast::Receiver<MessageInsert>,
}

impl FeedSubscription {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Next insert for this conversation.
    ///
    /// Returns `None` once the feed is gone or this subscriber fell behind and
    /// lost inserts; either way the consumer must refetch to close the gap.
    pub async fn recv(&mut self) -> Option<MessageInsert> {
        loop {
            match self.rx.recv().await {
                Ok(insert) if insert.conversation_id == self.conversation_id => return Some(insert),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        "Feed subscriber lagged by {} inserts, ending subscription", n
                    );
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Lazy stream of inserts; finite, ending when [`recv`](Self::recv) does.
    pub fn into_stream(mut self) -> impl Stream<Item = MessageInsert> + Send + 'static {
        async_stream::stream! {
            while let Some(insert) = self.recv().await {
                yield insert;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;

    fn insert(conversation_id: Uuid, content: &str) -> MessageInsert {
        MessageInsert {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: content.into(),
            created_at: Utc::now(),
            client_marker: None,
        }
    }

    #[tokio::test]
    async fn subscription_filters_by_conversation() {
        let feed = Feed::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = feed.subscribe(a);

        feed.publish(insert(b, "elsewhere"));
        feed.publish(insert(a, "here"));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.content, "here");
    }

    #[tokio::test]
    async fn only_inserts_after_subscribe_are_seen() {
        let feed = Feed::new();
        let conv = Uuid::new_v4();

        feed.publish(insert(conv, "before"));
        let mut stream = Box::pin(feed.subscribe(conv).into_stream());
        feed.publish(insert(conv, "after"));

        assert_eq!(stream.next().await.unwrap().content, "after");
    }

    #[tokio::test]
    async fn lagging_subscriber_ends() {
        let feed = Feed::with_capacity(2);
        let conv = Uuid::new_v4();
        let mut sub = feed.subscribe(conv);

        for i in 0..5 {
            feed.publish(insert(conv, &i.to_string()));
        }

        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let feed = Feed::new();
        let sub = feed.subscribe(Uuid::new_v4());
        assert_eq!(feed.subscriber_count(), 1);
        drop(sub);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
