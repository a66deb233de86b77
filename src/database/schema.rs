//! Database schema

use crate::utils::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::{debug, info};

/// Columns added after the first schema version, with their declarations.
/// Missing ones are appended to existing databases on open.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("kind", "TEXT NOT NULL DEFAULT 'manga'"),
    ("unit_sizes", "TEXT NOT NULL DEFAULT '[]'"),
    ("checkpoint_units", "INTEGER NOT NULL DEFAULT 0"),
    ("checkpoint_offset", "INTEGER NOT NULL DEFAULT 0"),
    ("checkpoint_bytes", "INTEGER NOT NULL DEFAULT 0"),
];

/// Initialize the database
pub async fn initialize_database(db_path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(crate::utils::error::QueueError::from_io)?;
        }
    }

    debug!("Opening database at: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // Connect to the database
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    // Run migrations
    info!("Running database migrations");
    create_tables(&pool).await?;
    add_missing_columns(&pool).await?;

    Ok(pool)
}

/// Create database tables
async fn create_tables(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            content_id TEXT NOT NULL,
            title TEXT NOT NULL,
            units TEXT NOT NULL,
            status TEXT NOT NULL,
            bytes_downloaded INTEGER NOT NULL DEFAULT 0,
            bytes_total INTEGER,
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            completed_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;

    // Single row naming the process currently running the queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_owner (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            pid INTEGER NOT NULL,
            heartbeat_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    debug!("Database tables created successfully");
    Ok(())
}

/// Append columns newer builds expect but this database predates
async fn add_missing_columns(pool: &Pool<Sqlite>) -> Result<()> {
    let rows = sqlx::query("PRAGMA table_info(tasks)")
        .fetch_all(pool)
        .await?;
    let existing: Vec<String> = rows.iter().map(|row| row.get::<String, _>("name")).collect();

    for (name, declaration) in ADDITIVE_COLUMNS {
        if existing.iter().any(|column| column == name) {
            continue;
        }
        info!("Adding column tasks.{}", name);
        sqlx::query(&format!("ALTER TABLE tasks ADD COLUMN {} {}", name, declaration))
            .execute(pool)
            .await?;
    }

    Ok(())
}
