use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use jobtalk_api::routes::router;
use jobtalk_api::state::AppStateInner;
use jobtalk_db::Database;
use jobtalk_gateway::feed::Feed;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobtalk=debug,jobtalk_api=debug,jobtalk_gateway=debug,jobtalk_db=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("JOBTALK_JWT_SECRET").unwrap_or_default();
    if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
        anyhow::bail!(
            "JOBTALK_JWT_SECRET is unset or still a placeholder; it must match the identity service's signing secret"
        );
    }

    let db_path: PathBuf = std::env::var("JOBTALK_DB_PATH")
        .unwrap_or_else(|_| "jobtalk.db".into())
        .into();
    let host = std::env::var("JOBTALK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("JOBTALK_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    if host == "0.0.0.0" {
        warn!("Listening on all interfaces; put a TLS-terminating proxy in front in production");
    }

    // Init database and live feed
    let db = Arc::new(Database::open(&db_path)?);
    let feed = Feed::new();

    let app = router(AppStateInner::new(db, feed, jwt_secret));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("jobtalk server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
