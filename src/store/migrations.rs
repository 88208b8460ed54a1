//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                associated_account TEXT NOT NULL,
                direction TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                response_id TEXT NOT NULL,
                in_reply_to TEXT NOT NULL DEFAULT '',
                reference_ids TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(associated_account, conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_response_id
                ON messages(associated_account, response_id);

            CREATE TABLE IF NOT EXISTS threads (
                conversation_id TEXT NOT NULL,
                associated_account TEXT NOT NULL,
                busy INTEGER NOT NULL DEFAULT 0,
                automation_enabled INTEGER NOT NULL DEFAULT 1,
                flag INTEGER NOT NULL DEFAULT 0,
                flag_for_review INTEGER NOT NULL DEFAULT 0,
                flag_review_override INTEGER NOT NULL DEFAULT 0,
                read INTEGER NOT NULL DEFAULT 0,
                ev_score INTEGER,
                ai_summary TEXT,
                budget_range TEXT,
                preferred_property_types TEXT,
                timeline TEXT,
                spam INTEGER NOT NULL DEFAULT 0,
                ttl INTEGER,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (associated_account, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_threads_ttl ON threads(ttl);

            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                reply_address TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                auto_reply_enabled INTEGER NOT NULL DEFAULT 1,
                api_limit INTEGER,
                ai_limit INTEGER
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                account_id TEXT NOT NULL,
                pool TEXT NOT NULL,
                invocations INTEGER NOT NULL DEFAULT 0,
                window_start INTEGER NOT NULL,
                PRIMARY KEY (account_id, pool)
            );

            CREATE TABLE IF NOT EXISTS invocations (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                conversation_id TEXT,
                model TEXT NOT NULL,
                purpose TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_invocations_account
                ON invocations(account_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "account_writing_preferences",
        sql: r#"
            ALTER TABLE accounts ADD COLUMN tone TEXT;
            ALTER TABLE accounts ADD COLUMN writing_style TEXT;
            ALTER TABLE accounts ADD COLUMN bio TEXT;
            ALTER TABLE accounts ADD COLUMN location TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "messages",
            "threads",
            "accounts",
            "rate_limits",
            "invocations",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn preference_columns_exist_after_v2() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO accounts (account_id, reply_address, tone, writing_style, bio, location)
             VALUES ('a1', 'agent@homes.test', 'warm', 'short sentences', 'Top agent', 'Austin, TX')",
            (),
        )
        .await
        .unwrap();
    }
}
