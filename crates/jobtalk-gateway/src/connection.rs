use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobtalk_db::Database;
use jobtalk_types::events::{GatewayCommand, GatewayEvent};

use crate::feed::Feed;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Subscriptions = Arc<RwLock<HashSet<Uuid>>>;

/// Handle a WebSocket connection whose JWT was validated at the HTTP upgrade.
///
/// The client subscribes to conversations it takes part in and then receives
/// every insert into them, "from now" only. There is no replay: a client
/// that reconnects refetches history over REST. A connection that falls
/// behind the feed is closed rather than left with a gap.
pub async fn handle_connection(socket: WebSocket, feed: Feed, db: Arc<Database>, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to gateway", user_id);

    // Subscribe before Ready so nothing published after Ready is missed.
    let mut broadcast_rx = feed.subscribe_all();

    let ready = GatewayEvent::Ready { user_id };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    // Per-connection conversation subscriptions (shared between send and recv tasks).
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    // Replies addressed to this connection only.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    // Set by the recv task on every Pong
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward subscribed inserts + replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let insert = match result {
                        Ok(insert) => insert,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Inserts were lost; the client must refetch.
                            warn!("Gateway receiver for {} lagged by {} inserts, closing", user_id, n);
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                        Err(_) => break,
                    };

                    let subscribed = send_subscriptions
                        .read()
                        .map(|subs| subs.contains(&insert.conversation_id))
                        .unwrap_or(false);
                    if !subscribed {
                        continue;
                    }

                    if send_event(&mut sender, &GatewayEvent::MessageInsert(insert)).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&db, user_id, cmd, &recv_subscriptions, &reply_tx).await;
                    }
                    Err(e) => {
                        let raw: String = text.chars().take(200).collect();
                        warn!("{} bad command: {} -- raw: {}", user_id, e, raw);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from gateway", user_id);
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn handle_command(
    db: &Arc<Database>,
    user_id: Uuid,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
    reply_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Subscribe { conversation_ids } => {
            info!("{} subscribing to {} conversations", user_id, conversation_ids.len());
            for conversation_id in conversation_ids {
                if is_participant(db, conversation_id, user_id).await {
                    if let Ok(mut subs) = subscriptions.write() {
                        subs.insert(conversation_id);
                    }
                    let _ = reply_tx.send(GatewayEvent::Subscribed { conversation_id });
                } else {
                    debug!("{} rejected from conversation {}", user_id, conversation_id);
                    let _ = reply_tx.send(GatewayEvent::SubscribeRejected { conversation_id });
                }
            }
        }

        GatewayCommand::Unsubscribe { conversation_ids } => {
            if let Ok(mut subs) = subscriptions.write() {
                for conversation_id in &conversation_ids {
                    subs.remove(conversation_id);
                }
            }
        }
    }
}

async fn is_participant(db: &Arc<Database>, conversation_id: Uuid, user_id: Uuid) -> bool {
    // Run blocking DB lookup off the async runtime
    let db = db.clone();
    let lookup = tokio::task::spawn_blocking(move || db.get_conversation(conversation_id)).await;

    match lookup {
        Ok(Ok(Some(conversation))) => conversation.is_participant(user_id),
        Ok(Ok(None)) => false,
        Ok(Err(e)) => {
            warn!("Participant lookup for {} failed: {}", conversation_id, e);
            false
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            false
        }
    }
}
