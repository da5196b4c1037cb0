use std::sync::Arc;

use jobtalk_db::Database;
use jobtalk_gateway::feed::Feed;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub feed: Feed,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, feed: Feed, jwt_secret: String) -> AppState {
        Arc::new(Self { db, feed, jwt_secret })
    }
}
