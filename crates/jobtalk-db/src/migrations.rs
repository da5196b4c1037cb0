use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

// Timestamps are written by the application as fixed-width RFC 3339 text
// (microsecond precision, `Z` suffix) so that text order is time order.
// No column defaults to `datetime('now')` for that reason.

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE conversations (
                id                          TEXT PRIMARY KEY,
                job_id                      TEXT NOT NULL,
                jobseeker_id                TEXT NOT NULL,
                employer_id                 TEXT NOT NULL,
                phone_shared_by_jobseeker   INTEGER NOT NULL DEFAULT 0,
                phone_shared_by_employer    INTEGER NOT NULL DEFAULT 0,
                created_at                  TEXT NOT NULL,
                UNIQUE(job_id, jobseeker_id, employer_id)
            );

            CREATE INDEX idx_conversations_jobseeker ON conversations(jobseeker_id);
            CREATE INDEX idx_conversations_employer ON conversations(employer_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL,
                content         TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                read            INTEGER NOT NULL DEFAULT 0,
                client_marker   TEXT UNIQUE
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, id);

            CREATE TABLE application_links (
                job_id          TEXT NOT NULL,
                applicant_id    TEXT NOT NULL,
                employer_id     TEXT NOT NULL,
                status          TEXT NOT NULL
                                CHECK (status IN ('applied', 'accepted', 'rejected')),
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (job_id, applicant_id)
            );

            CREATE TABLE hire_requests (
                id              TEXT PRIMARY KEY,
                job_id          TEXT NOT NULL,
                employer_id     TEXT NOT NULL,
                jobseeker_id    TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                UNIQUE(job_id, employer_id, jobseeker_id)
            );

            CREATE INDEX idx_hire_requests_pair
                ON hire_requests(employer_id, jobseeker_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
