#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Semaphore;
use uuid::Uuid;

use jobtalk_db::Database;
use jobtalk_gateway::feed::Feed;
use jobtalk_sync::backend::{Backend, FeedStream, OutgoingMessage};
use jobtalk_sync::{ChannelView, ConversationView, LocalBackend, RetryPolicy, SyncConfig, SyncCoordinator, SyncError};
use jobtalk_types::models::{ApplicationStatus, Conversation, ConversationSummary, Identity, Message, Role};

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    }
}

/// One job with one jobseeker and one employer on a shared database.
pub struct World {
    pub db: Arc<Database>,
    pub feed: Feed,
    pub job: Uuid,
    pub seeker: Identity,
    pub employer: Identity,
}

impl World {
    pub fn new() -> Self {
        Self {
            db: Arc::new(Database::open_in_memory().unwrap()),
            feed: Feed::new(),
            job: Uuid::new_v4(),
            seeker: Identity {
                user_id: Uuid::new_v4(),
                role: Role::Jobseeker,
            },
            employer: Identity {
                user_id: Uuid::new_v4(),
                role: Role::Employer,
            },
        }
    }

    pub fn local(&self) -> LocalBackend {
        LocalBackend::new(self.db.clone(), self.feed.clone())
    }

    pub fn flaky(&self) -> Arc<FlakyBackend> {
        Arc::new(FlakyBackend::new(self.local()))
    }

    pub fn session(&self, identity: Identity) -> SyncCoordinator<LocalBackend> {
        SyncCoordinator::for_backend(Arc::new(self.local()), identity, fast_config())
    }

    pub fn apply(&self) {
        self.db
            .apply(self.job, self.seeker.user_id, self.employer.user_id)
            .unwrap();
    }

    pub fn hire(&self) {
        self.db
            .create_hire_request(self.job, self.employer.user_id, self.seeker.user_id)
            .unwrap();
    }

    pub fn conversation(&self) -> Uuid {
        self.db
            .upsert_conversation(self.job, self.seeker.user_id, self.employer.user_id)
            .unwrap()
            .id
    }

    pub fn history(&self, conversation_id: Uuid) -> Vec<Message> {
        self.db.get_messages(conversation_id).unwrap()
    }
}

/// Wait until `pred` holds for the view, failing after five seconds.
pub async fn wait_for(view: &mut ConversationView, what: &str, pred: impl Fn(&ChannelView) -> bool) -> ChannelView {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = view.current();
            if pred(&current) {
                return current;
            }
            if view.changed().await.is_none() {
                panic!("view closed while waiting for {}", what);
            }
        }
    })
    .await;

    waited.unwrap_or_else(|_| panic!("timed out waiting for {}; last view: {:?}", what, view.current()))
}

/// Local backend with switchable connectivity and injectable send faults.
pub struct FlakyBackend {
    inner: LocalBackend,
    online: Arc<AtomicBool>,
    fail_sends: AtomicBool,
    conflict_sends: AtomicBool,
    fail_history: AtomicBool,
    hold_sends: AtomicBool,
    send_permits: Semaphore,
    send_attempts: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            online: Arc::new(AtomicBool::new(true)),
            fail_sends: AtomicBool::new(false),
            conflict_sends: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            hold_sends: AtomicBool::new(false),
            send_permits: Semaphore::new(0),
            send_attempts: AtomicUsize::new(0),
        }
    }

    /// Offline also ends every live stream at its next insert.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Store sends, then answer them with a conflict.
    pub fn conflict_sends(&self, conflict: bool) {
        self.conflict_sends.store(conflict, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Park every send attempt until released.
    pub fn hold_sends(&self, hold: bool) {
        self.hold_sends.store(hold, Ordering::SeqCst);
    }

    pub fn release_sends(&self, attempts: usize) {
        self.send_permits.add_permits(attempts);
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Network("offline".into()))
        }
    }
}

impl Backend for FlakyBackend {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, SyncError> {
        self.check()?;
        self.inner.list_conversations(user_id).await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>, SyncError> {
        self.check()?;
        self.inner.get_conversation(conversation_id).await
    }

    async fn fetch_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, SyncError> {
        self.check()?;
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(SyncError::Network("injected history failure".into()));
        }
        self.inner.fetch_history(conversation_id).await
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<FeedStream, SyncError> {
        self.check()?;
        let online = self.online.clone();
        let stream = self.inner.subscribe(conversation_id).await?;
        Ok(stream
            .take_while(move |_| futures_util::future::ready(online.load(Ordering::SeqCst)))
            .boxed())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<Message, SyncError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.hold_sends.load(Ordering::SeqCst) {
            self.send_permits.acquire().await.unwrap().forget();
        }
        self.check()?;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Network("injected failure".into()));
        }
        let stored = self.inner.send_message(message).await?;
        if self.conflict_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Conflict("injected conflict".into()));
        }
        Ok(stored)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<(), SyncError> {
        self.check()?;
        self.inner.mark_read(conversation_id, reader_id).await
    }

    async fn share_phone(&self, conversation_id: Uuid, sharer_id: Uuid) -> Result<(), SyncError> {
        self.check()?;
        self.inner.share_phone(conversation_id, sharer_id).await
    }

    async fn application_status(&self, job_id: Uuid, applicant_id: Uuid) -> Result<Option<ApplicationStatus>, SyncError> {
        self.check()?;
        self.inner.application_status(job_id, applicant_id).await
    }

    async fn hire_request_exists(&self, employer_id: Uuid, jobseeker_id: Uuid) -> Result<bool, SyncError> {
        self.check()?;
        self.inner.hire_request_exists(employer_id, jobseeker_id).await
    }
}
