/// Coordinator against a real server on a loopback port.
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use uuid::Uuid;

use jobtalk_api::auth::create_token;
use jobtalk_api::routes::router;
use jobtalk_api::state::AppStateInner;
use jobtalk_gateway::feed::Feed;
use jobtalk_sync::backend::{Backend, OutgoingMessage};
use jobtalk_sync::{ChannelState, Delivery, RemoteBackend, SendOutcome, SyncCoordinator, SyncError};
use jobtalk_types::access::DenyReason;
use jobtalk_types::events::MessageInsert;
use jobtalk_types::models::{Identity, Role};

use common::{World, fast_config, wait_for};

const SECRET: &str = "remote-test-secret";

async fn serve(w: &World) -> String {
    let app = router(AppStateInner::new(w.db.clone(), w.feed.clone(), SECRET.into()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn remote(base: &str, identity: Identity) -> Arc<RemoteBackend> {
    let token = create_token(SECRET, identity.user_id, identity.role).unwrap();
    Arc::new(RemoteBackend::new(base, token))
}

#[tokio::test]
async fn messages_flow_over_http_and_gateway() {
    let w = World::new();
    w.apply();
    let conv = w.conversation();
    let base = serve(&w).await;

    let seeker = SyncCoordinator::for_backend(remote(&base, w.seeker), w.seeker, fast_config());
    let employer = SyncCoordinator::for_backend(remote(&base, w.employer), w.employer, fast_config());

    let mut employer_view = employer.open(conv).await.unwrap();
    assert_eq!(employer_view.current().state, ChannelState::Live);
    assert_eq!(employer_view.current().last_error, None);

    seeker.open(conv).await.unwrap();
    let outcome = seeker.send_message(conv, "Hello over the wire").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Delivered(Delivery::Confirmed { .. })));

    let current = wait_for(&mut employer_view, "insert over the gateway", |v| v.items.len() == 1).await;
    assert_eq!(current.contents(), ["Hello over the wire"]);

    let list = seeker.refresh_conversations().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].last_message.as_ref().unwrap().content, "Hello over the wire");
    assert_eq!(list[0].counterparty_id, w.employer.user_id);

    // The server enforces the same rule the gate does.
    assert_eq!(
        employer.send_message(conv, "Hi").await.unwrap(),
        SendOutcome::Blocked(DenyReason::NoHireRequest)
    );
}

#[tokio::test]
async fn server_rules_surface_as_errors() {
    let w = World::new();
    let conv = w.conversation();
    let base = serve(&w).await;

    let employer = remote(&base, w.employer);
    let err = employer
        .send_message(OutgoingMessage {
            conversation_id: conv,
            sender_id: w.employer.user_id,
            content: "Hi".into(),
            client_marker: Uuid::new_v4(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::Authorization(DenyReason::NoHireRequest));
    assert!(!err.is_transient());

    assert_eq!(employer.application_status(w.job, w.seeker.user_id).await, Ok(None));
    assert_eq!(employer.hire_request_exists(w.employer.user_id, w.seeker.user_id).await, Ok(false));

    let outsider = remote(
        &base,
        Identity {
            user_id: Uuid::new_v4(),
            role: Role::Jobseeker,
        },
    );
    assert_eq!(outsider.fetch_history(conv).await, Err(SyncError::NotFound));
    assert_eq!(outsider.get_conversation(conv).await, Ok(None));
    assert!(matches!(outsider.subscribe(conv).await, Err(SyncError::NotFound)));
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    let backend = RemoteBackend::new("http://127.0.0.1:9", "token");
    let err = backend.fetch_history(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn reused_marker_is_a_conflict() {
    let w = World::new();
    w.apply();
    w.hire();
    let conv = w.conversation();
    let base = serve(&w).await;

    let marker = Uuid::new_v4();
    let outgoing = |sender: Identity, content: &str| OutgoingMessage {
        conversation_id: conv,
        sender_id: sender.user_id,
        content: content.into(),
        client_marker: marker,
    };

    remote(&base, w.seeker)
        .send_message(outgoing(w.seeker, "mine"))
        .await
        .unwrap();
    let err = remote(&base, w.employer)
        .send_message(outgoing(w.employer, "not mine"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));
    assert!(!err.is_transient());
    assert_eq!(w.history(conv).len(), 1);
}

#[tokio::test]
async fn lagging_gateway_ends_the_stream() {
    let w = World {
        feed: Feed::with_capacity(1),
        ..World::new()
    };
    w.apply();
    let conv = w.conversation();
    let base = serve(&w).await;

    let stream = remote(&base, w.seeker).subscribe(conv).await.unwrap();

    // Published without yielding, so the gateway falls behind.
    const BURST: usize = 32;
    for n in 0..BURST {
        w.feed.publish(MessageInsert {
            id: Uuid::new_v4(),
            conversation_id: conv,
            sender_id: w.employer.user_id,
            content: format!("burst {}", n),
            created_at: Utc::now(),
            client_marker: None,
        });
    }

    let received = tokio::time::timeout(Duration::from_secs(5), stream.count())
        .await
        .expect("stream kept running after the gateway fell behind");
    assert!(received < BURST);
}
