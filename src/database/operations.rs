//! Database CRUD operations

use crate::queue::task::{Checkpoint, DownloadTask, TaskStatus};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// Database manager
#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<Sqlite>,
}

impl DatabaseManager {
    /// Create new database manager
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or replace a task record
    pub async fn save_task(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks
            (id, content_id, kind, title, units, unit_sizes, status, bytes_downloaded, bytes_total,
             priority, retry_count, last_error, checkpoint_units, checkpoint_offset,
             checkpoint_bytes, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.content_id)
        .bind(task.kind.as_str())
        .bind(&task.title)
        .bind(serde_json::to_string(&task.units)?)
        .bind(serde_json::to_string(&task.unit_sizes)?)
        .bind(task.status.as_str())
        .bind(task.bytes_downloaded as i64)
        .bind(task.bytes_total.map(|v| v as i64))
        .bind(task.priority)
        .bind(task.retry_count as i64)
        .bind(&task.last_error)
        .bind(task.checkpoint.units_completed as i64)
        .bind(task.checkpoint.unit_offset as i64)
        .bind(task.checkpoint.bytes_downloaded as i64)
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved task record: {} ({})", task.id, task.status);
        Ok(())
    }

    /// Get task record by ID
    pub async fn get_task(&self, id: &str) -> Result<Option<DownloadTask>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_into_task(row)?)),
            None => Ok(None),
        }
    }

    /// Get all task records, oldest first
    pub async fn get_all_tasks(&self) -> Result<Vec<DownloadTask>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(row_into_task(row)?);
        }

        Ok(tasks)
    }

    /// Ids of every task record
    pub async fn get_task_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM tasks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Delete task record
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!("Deleted task record: {}", id);
        Ok(())
    }

    /// Take the run lease for `pid`. Succeeds when nobody holds it, when
    /// `pid` already does, or when the holder's heartbeat is older than
    /// `stale_before_ms`.
    pub async fn claim_lease(&self, pid: u32, now_ms: i64, stale_before_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue_owner (id, pid, heartbeat_ms) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, heartbeat_ms = excluded.heartbeat_ms
            WHERE queue_owner.pid = excluded.pid OR queue_owner.heartbeat_ms < ?
            "#,
        )
        .bind(pid as i64)
        .bind(now_ms)
        .bind(stale_before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Refresh the heartbeat; false when `pid` no longer holds the lease
    pub async fn renew_lease(&self, pid: u32, now_ms: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE queue_owner SET heartbeat_ms = ? WHERE pid = ?")
            .bind(now_ms)
            .bind(pid as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lease(&self, pid: u32) -> Result<()> {
        sqlx::query("DELETE FROM queue_owner WHERE pid = ?")
            .bind(pid as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Process holding a live lease, if any
    pub async fn lease_holder(&self, stale_before_ms: i64) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT pid FROM queue_owner WHERE heartbeat_ms >= ?")
            .bind(stale_before_ms)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("pid") as u32))
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Convert database row to task. Columns are read by name so rows written by
/// newer builds with extra columns still load.
fn row_into_task(row: sqlx::sqlite::SqliteRow) -> Result<DownloadTask> {
    let units: Vec<String> = serde_json::from_str(row.get::<&str, _>("units"))?;
    let mut unit_sizes: Vec<Option<u64>> = serde_json::from_str(row.get::<&str, _>("unit_sizes"))?;
    unit_sizes.resize(units.len(), None);

    Ok(DownloadTask {
        id: row.get("id"),
        content_id: row.get("content_id"),
        kind: row.get::<&str, _>("kind").parse()?,
        title: row.get("title"),
        units,
        status: row.get::<&str, _>("status").parse::<TaskStatus>()?,
        bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
        bytes_total: row.get::<Option<i64>, _>("bytes_total").map(|v| v as u64),
        unit_sizes,
        priority: row.get::<i64, _>("priority") as i32,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_error: row.get("last_error"),
        checkpoint: Checkpoint {
            units_completed: row.get::<i64, _>("checkpoint_units") as usize,
            unit_offset: row.get::<i64, _>("checkpoint_offset") as u64,
            bytes_downloaded: row.get::<i64, _>("checkpoint_bytes") as u64,
        },
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        completed_at: row.get("completed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::queue::task::{ContentKind, NewTask};

    async fn manager() -> (DatabaseManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = initialize_database(&dir.path().join("q.db")).await.unwrap();
        (DatabaseManager::new(pool), dir)
    }

    #[tokio::test]
    async fn test_save_and_get_task() {
        let (db, _dir) = manager().await;
        let mut task = DownloadTask::new(
            NewTask::new("frieren", ContentKind::Anime, vec!["e1".into(), "e2".into()])
                .title("Frieren")
                .priority(5),
        );
        task.resolve_unit_size(0, 4096);
        task.last_error = Some("timeout".into());
        task.checkpoint = Checkpoint {
            units_completed: 1,
            unit_offset: 12,
            bytes_downloaded: 4108,
        };
        db.save_task(&task).await.unwrap();

        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Frieren");
        assert_eq!(loaded.kind, ContentKind::Anime);
        assert_eq!(loaded.units, task.units);
        assert_eq!(loaded.unit_sizes, vec![Some(4096), None]);
        assert_eq!(loaded.bytes_total, Some(8192));
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
        assert_eq!(loaded.checkpoint, task.checkpoint);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_stale() {
        let (db, _dir) = manager().await;

        assert!(db.claim_lease(100, 1_000, 0).await.unwrap());
        assert_eq!(db.lease_holder(0).await.unwrap(), Some(100));
        // Holder may claim again; others may not while it is fresh
        assert!(db.claim_lease(100, 2_000, 1_000).await.unwrap());
        assert!(!db.claim_lease(200, 2_500, 1_500).await.unwrap());
        assert!(db.renew_lease(100, 3_000).await.unwrap());
        assert!(!db.renew_lease(200, 3_000).await.unwrap());

        // Heartbeat at 3_000 is stale once the cutoff passes it
        assert_eq!(db.lease_holder(5_000).await.unwrap(), None);
        assert!(db.claim_lease(200, 20_000, 5_000).await.unwrap());
        assert_eq!(db.lease_holder(5_000).await.unwrap(), Some(200));

        db.release_lease(100).await.unwrap();
        assert_eq!(db.lease_holder(0).await.unwrap(), Some(200));
        db.release_lease(200).await.unwrap();
        assert_eq!(db.lease_holder(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_task() {
        let (db, _dir) = manager().await;
        let task = DownloadTask::new(NewTask::new("x", ContentKind::Manga, vec!["c".into()]));
        db.save_task(&task).await.unwrap();
        db.delete_task(&task.id).await.unwrap();
        assert!(db.get_task(&task.id).await.unwrap().is_none());
        assert!(db.get_all_tasks().await.unwrap().is_empty());
    }
}
