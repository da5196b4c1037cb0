//! Per-conversation message buffer.
//!
//! [`MessageChannel`] is a plain state machine: history and live inserts go
//! in, a [`ChannelView`] snapshot comes out. It does no I/O, so the
//! coordinator owns all scheduling and the ordering rules can be tested
//! without a runtime.
//!
//! Invariants kept by every transition:
//! - confirmed messages are strictly ascending by `(created_at, id)`
//! - no message id appears twice
//! - an outgoing entry disappears once a persisted message carrying its
//!   temp id as `client_marker` is seen, whichever path delivered it first

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobtalk_types::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    /// Subscribed (or waiting to) but history not merged yet.
    Subscribing,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Optimistic copy; the write has not been confirmed.
    Pending { temp_id: Uuid },
    Confirmed { id: Uuid },
    /// The write failed. The entry stays visible until retried.
    Failed { temp_id: Uuid, reason: String },
}

impl Delivery {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A message the local user sent that is not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub temp_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub queued_at: DateTime<Utc>,
    pub failure: Option<String>,
}

impl Outgoing {
    pub fn delivery(&self) -> Delivery {
        match &self.failure {
            Some(reason) => Delivery::Failed {
                temp_id: self.temp_id,
                reason: reason.clone(),
            },
            None => Delivery::Pending { temp_id: self.temp_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelItem {
    pub delivery: Delivery,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot handed to the UI: confirmed messages in order, then the local
/// user's unconfirmed sends in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    pub conversation_id: Uuid,
    pub state: ChannelState,
    pub items: Vec<ChannelItem>,
    /// Last failure to subscribe or load history, cleared once live.
    pub last_error: Option<String>,
}

impl ChannelView {
    pub fn confirmed_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter_map(|item| match item.delivery {
                Delivery::Confirmed { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn contents(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.content.as_str()).collect()
    }
}

/// Outcome of settling an outgoing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The entry was replaced by the persisted message.
    Confirmed(Message),
    /// The entry was marked failed and kept for retry.
    Failed,
    /// No entry with that temp id: the feed already delivered the persisted
    /// copy, or the entry was discarded.
    Unknown,
}

/// Settle outgoing entry `temp_id` with the result of its write.
pub fn reconcile(outgoing: &mut Vec<Outgoing>, temp_id: Uuid, outcome: Result<Message, String>) -> Reconciled {
    let Some(pos) = outgoing.iter().position(|o| o.temp_id == temp_id) else {
        return Reconciled::Unknown;
    };

    match outcome {
        Ok(message) => {
            outgoing.remove(pos);
            Reconciled::Confirmed(message)
        }
        Err(reason) => {
            outgoing[pos].failure = Some(reason);
            Reconciled::Failed
        }
    }
}

#[derive(Debug)]
pub struct MessageChannel {
    conversation_id: Uuid,
    state: ChannelState,
    history_loaded: bool,
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
    /// Live inserts that arrived before history.
    early: Vec<Message>,
    outgoing: Vec<Outgoing>,
    last_error: Option<String>,
}

impl MessageChannel {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            state: ChannelState::Closed,
            history_loaded: false,
            messages: Vec::new(),
            ids: HashSet::new(),
            early: Vec::new(),
            outgoing: Vec::new(),
            last_error: None,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn outgoing(&self) -> &[Outgoing] {
        &self.outgoing
    }

    /// Start a fresh session. `carried` are unresolved sends from an earlier
    /// session of the same conversation.
    pub fn begin_open(&mut self, carried: Vec<Outgoing>) {
        self.messages.clear();
        self.ids.clear();
        self.outgoing = carried;
        self.restart();
    }

    /// Rebuild after a lost connection. The stale messages stay visible
    /// until the new history replaces them wholesale.
    pub fn restart(&mut self) {
        self.state = ChannelState::Subscribing;
        self.history_loaded = false;
        self.early.clear();
    }

    /// Replace the buffer with `history`, then fold in anything the live
    /// feed delivered meanwhile. Ignored when closed.
    pub fn apply_history(&mut self, history: Vec<Message>) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }

        let early = std::mem::take(&mut self.early);
        self.messages.clear();
        self.ids.clear();
        for message in history.into_iter().chain(early) {
            self.merge(message);
        }

        self.history_loaded = true;
        self.state = ChannelState::Live;
        self.last_error = None;
        true
    }

    /// Fold in a live insert. Returns whether the view changed.
    pub fn apply_live(&mut self, message: Message) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }

        if !self.history_loaded {
            // Only our own sends show before history; the rest wait for it.
            let settled = self.settle_marker(&message);
            self.hold_early(&message);
            if settled {
                self.merge(message);
            }
            return settled;
        }

        self.merge(message)
    }

    /// Append an optimistic copy of a local send. Returns its temp id.
    pub fn push_pending(&mut self, sender_id: Uuid, content: String, queued_at: DateTime<Utc>) -> Uuid {
        let temp_id = Uuid::new_v4();
        self.outgoing.push(Outgoing {
            temp_id,
            sender_id,
            content,
            queued_at,
            failure: None,
        });
        temp_id
    }

    pub fn reconcile(&mut self, temp_id: Uuid, outcome: Result<Message, String>) -> Reconciled {
        let confirmed = match &outcome {
            Ok(message) => Some(message.clone()),
            Err(_) => None,
        };
        let result = reconcile(&mut self.outgoing, temp_id, outcome);

        // The persisted copy belongs in the buffer even if the feed beat us,
        // and stays on screen while history is still loading.
        if let Some(message) = confirmed {
            if self.state == ChannelState::Closed {
                return result;
            }
            if !self.history_loaded {
                self.hold_early(&message);
            }
            self.merge(message);
        }
        result
    }

    /// Flip a failed entry back to pending. Returns it, or `None` if no
    /// failed entry has that temp id.
    pub fn mark_retrying(&mut self, temp_id: Uuid) -> Option<Outgoing> {
        let entry = self
            .outgoing
            .iter_mut()
            .find(|o| o.temp_id == temp_id && o.failure.is_some())?;
        entry.failure = None;
        Some(entry.clone())
    }

    /// Where a local send stands, if this channel still knows about it.
    pub fn delivery_of(&self, temp_id: Uuid) -> Option<Delivery> {
        if let Some(entry) = self.outgoing.iter().find(|o| o.temp_id == temp_id) {
            return Some(entry.delivery());
        }
        self.messages
            .iter()
            .find(|m| m.client_marker == Some(temp_id))
            .map(|m| Delivery::Confirmed { id: m.id })
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Discard the buffer. Returns unresolved sends so they can outlive
    /// this session.
    pub fn close(&mut self) -> Vec<Outgoing> {
        self.state = ChannelState::Closed;
        self.history_loaded = false;
        self.messages.clear();
        self.ids.clear();
        self.early.clear();
        self.last_error = None;
        std::mem::take(&mut self.outgoing)
    }

    pub fn snapshot(&self) -> ChannelView {
        let confirmed = self.messages.iter().map(|m| ChannelItem {
            delivery: Delivery::Confirmed { id: m.id },
            sender_id: m.sender_id,
            content: m.content.clone(),
            created_at: m.created_at,
        });
        let outgoing = self.outgoing.iter().map(|o| ChannelItem {
            delivery: o.delivery(),
            sender_id: o.sender_id,
            content: o.content.clone(),
            created_at: o.queued_at,
        });

        ChannelView {
            conversation_id: self.conversation_id,
            state: self.state,
            items: confirmed.chain(outgoing).collect(),
            last_error: self.last_error.clone(),
        }
    }

    fn merge(&mut self, message: Message) -> bool {
        let settled = self.settle_marker(&message);
        if self.ids.contains(&message.id) {
            return settled;
        }

        let key = message.order_key();
        let pos = self.messages.partition_point(|m| m.order_key() < key);
        self.ids.insert(message.id);
        self.messages.insert(pos, message);
        true
    }

    /// Keep `message` for the merge with the coming history.
    fn hold_early(&mut self, message: &Message) {
        if !self.early.iter().any(|m| m.id == message.id) {
            self.early.push(message.clone());
        }
    }

    fn settle_marker(&mut self, message: &Message) -> bool {
        let Some(marker) = message.client_marker else {
            return false;
        };
        let before = self.outgoing.len();
        self.outgoing.retain(|o| o.temp_id != marker);
        self.outgoing.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(conversation_id: Uuid, secs: i64, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: content.into(),
            created_at: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs),
            read: false,
            client_marker: None,
        }
    }

    fn live_channel() -> MessageChannel {
        let mut channel = MessageChannel::new(Uuid::new_v4());
        channel.begin_open(Vec::new());
        channel.apply_history(Vec::new());
        channel
    }

    fn assert_strictly_ordered(channel: &MessageChannel) {
        for pair in channel.messages().windows(2) {
            assert!(pair[0].order_key() < pair[1].order_key());
        }
    }

    #[test]
    fn new_channel_is_closed_and_ignores_input() {
        let conv = Uuid::new_v4();
        let mut channel = MessageChannel::new(conv);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.apply_live(message(conv, 1, "x")));
        assert!(!channel.apply_history(vec![message(conv, 1, "x")]));
        assert!(channel.messages().is_empty());
    }

    #[test]
    fn out_of_order_inserts_end_up_ordered() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let all: Vec<Message> = (0..20).map(|i| message(conv, i, &i.to_string())).collect();

        // Evens backwards, then odds forwards.
        for m in all.iter().filter(|m| m.created_at.timestamp() % 2 == 0).rev() {
            channel.apply_live(m.clone());
        }
        for m in all.iter().filter(|m| m.created_at.timestamp() % 2 == 1) {
            channel.apply_live(m.clone());
        }

        assert_eq!(channel.messages().len(), 20);
        assert_strictly_ordered(&channel);
        assert_eq!(channel.messages()[0].content, "0");
        assert_eq!(channel.messages()[19].content, "19");
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let a = message(conv, 5, "a");
        let mut b = message(conv, 5, "b");
        b.created_at = a.created_at;

        channel.apply_live(b.clone());
        channel.apply_live(a.clone());

        let expected = if a.id < b.id { ["a", "b"] } else { ["b", "a"] };
        let contents: Vec<&str> = channel.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn merging_twice_changes_nothing() {
        let mut channel = live_channel();
        let m = message(channel.conversation_id(), 1, "once");

        assert!(channel.apply_live(m.clone()));
        let before = channel.snapshot();
        assert!(!channel.apply_live(m));
        assert_eq!(channel.snapshot(), before);
    }

    #[test]
    fn inserts_before_history_are_kept() {
        let mut channel = MessageChannel::new(Uuid::new_v4());
        let conv = channel.conversation_id();
        channel.begin_open(Vec::new());

        let old = message(conv, 1, "old");
        let raced = message(conv, 2, "raced");
        let fresh = message(conv, 3, "fresh");

        // `raced` is both in the history and on the feed; `fresh` only on the feed.
        channel.apply_live(raced.clone());
        channel.apply_live(fresh.clone());
        assert_eq!(channel.snapshot().items.len(), 0);

        channel.apply_history(vec![old, raced]);
        assert_eq!(channel.state(), ChannelState::Live);
        assert_eq!(channel.snapshot().contents(), ["old", "raced", "fresh"]);
    }

    #[test]
    fn own_send_stays_visible_before_history() {
        let mut channel = MessageChannel::new(Uuid::new_v4());
        let conv = channel.conversation_id();
        channel.begin_open(Vec::new());
        let me = Uuid::new_v4();

        let confirmed_first = channel.push_pending(me, "Hi".into(), Utc::now());
        let echoed_first = channel.push_pending(me, "There".into(), Utc::now());

        let mut hi = message(conv, 1, "Hi");
        hi.client_marker = Some(confirmed_first);
        assert!(matches!(channel.reconcile(confirmed_first, Ok(hi.clone())), Reconciled::Confirmed(_)));

        let mut there = message(conv, 2, "There");
        there.client_marker = Some(echoed_first);
        assert!(channel.apply_live(there.clone()));

        // Someone else's insert still waits for the history.
        channel.apply_live(message(conv, 3, "theirs"));

        let view = channel.snapshot();
        assert_eq!(view.state, ChannelState::Subscribing);
        assert_eq!(view.contents(), ["Hi", "There"]);
        assert!(view.items.iter().all(|i| i.delivery.is_confirmed()));

        assert_eq!(channel.delivery_of(confirmed_first), Some(Delivery::Confirmed { id: hi.id }));

        // Late echo and late confirmation change nothing.
        channel.apply_live(hi.clone());
        assert_eq!(channel.reconcile(echoed_first, Ok(there.clone())), Reconciled::Unknown);
        assert_eq!(channel.snapshot(), view);

        // History that predates both sends still ends with them.
        channel.apply_history(Vec::new());
        assert_eq!(channel.snapshot().contents(), ["Hi", "There", "theirs"]);
        assert_strictly_ordered(&channel);
    }

    #[test]
    fn pending_settles_on_feed_echo() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let me = Uuid::new_v4();
        let temp_id = channel.push_pending(me, "Hi".into(), Utc::now());

        let view = channel.snapshot();
        assert_eq!(view.items[0].delivery, Delivery::Pending { temp_id });

        let mut echo = message(conv, 1, "Hi");
        echo.sender_id = me;
        echo.client_marker = Some(temp_id);
        channel.apply_live(echo.clone());

        let view = channel.snapshot();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].delivery, Delivery::Confirmed { id: echo.id });

        // The write's own confirmation arrives late and changes nothing.
        assert_eq!(channel.reconcile(temp_id, Ok(echo)), Reconciled::Unknown);
        assert_eq!(channel.snapshot(), view);
    }

    #[test]
    fn confirmation_before_echo_does_not_duplicate() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let temp_id = channel.push_pending(Uuid::new_v4(), "Hi".into(), Utc::now());

        let mut stored = message(conv, 1, "Hi");
        stored.client_marker = Some(temp_id);

        assert!(matches!(channel.reconcile(temp_id, Ok(stored.clone())), Reconciled::Confirmed(_)));
        channel.apply_live(stored);

        assert_eq!(channel.snapshot().items.len(), 1);
        assert!(channel.outgoing().is_empty());
    }

    #[test]
    fn failed_send_is_retained_until_retried() {
        let mut channel = live_channel();
        let temp_id = channel.push_pending(Uuid::new_v4(), "Hi".into(), Utc::now());

        assert_eq!(channel.reconcile(temp_id, Err("offline".into())), Reconciled::Failed);
        let view = channel.snapshot();
        assert_eq!(
            view.items[0].delivery,
            Delivery::Failed {
                temp_id,
                reason: "offline".into()
            }
        );

        let entry = channel.mark_retrying(temp_id).unwrap();
        assert_eq!(entry.content, "Hi");
        assert!(channel.snapshot().items[0].delivery.is_pending());

        // Only failed entries can be retried.
        assert!(channel.mark_retrying(temp_id).is_none());
        assert!(channel.mark_retrying(Uuid::new_v4()).is_none());
    }

    #[test]
    fn outgoing_follows_confirmed_in_send_order() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let me = Uuid::new_v4();
        channel.push_pending(me, "first".into(), Utc::now());
        channel.push_pending(me, "second".into(), Utc::now());
        channel.apply_live(message(conv, 1, "theirs"));

        assert_eq!(channel.snapshot().contents(), ["theirs", "first", "second"]);
    }

    #[test]
    fn close_discards_buffer_but_returns_unresolved() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        channel.apply_live(message(conv, 1, "seen"));
        let temp_id = channel.push_pending(Uuid::new_v4(), "unsent".into(), Utc::now());

        let carried = channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.messages().is_empty());
        assert_eq!(carried.len(), 1);
        assert!(!channel.apply_live(message(conv, 2, "late")));

        channel.begin_open(carried);
        channel.apply_history(vec![message(conv, 1, "seen")]);
        let view = channel.snapshot();
        assert_eq!(view.contents(), ["seen", "unsent"]);
        assert_eq!(view.items[1].delivery, Delivery::Pending { temp_id });
    }

    #[test]
    fn restart_keeps_stale_view_until_history() {
        let mut channel = live_channel();
        let conv = channel.conversation_id();
        let seen = message(conv, 1, "seen");
        channel.apply_live(seen.clone());

        channel.restart();
        assert_eq!(channel.state(), ChannelState::Subscribing);
        assert_eq!(channel.snapshot().contents(), ["seen"]);

        // Missed while disconnected; the new history has both.
        let missed = message(conv, 2, "missed");
        channel.apply_history(vec![seen, missed]);
        assert_eq!(channel.snapshot().contents(), ["seen", "missed"]);
        assert_strictly_ordered(&channel);
    }

    #[test]
    fn reconcile_on_detached_entries() {
        let conv = Uuid::new_v4();
        let mut parked = vec![Outgoing {
            temp_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "late".into(),
            queued_at: Utc::now(),
            failure: None,
        }];
        let temp_id = parked[0].temp_id;

        assert_eq!(reconcile(&mut parked, temp_id, Err("timeout".into())), Reconciled::Failed);
        assert!(parked[0].delivery().is_failed());

        let stored = message(conv, 1, "late");
        assert!(matches!(reconcile(&mut parked, temp_id, Ok(stored)), Reconciled::Confirmed(_)));
        assert!(parked.is_empty());
    }
}
