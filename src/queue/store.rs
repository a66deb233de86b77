//! Durable task store
//!
//! Single source of truth for task records. Every task sits behind its own
//! lock, so writers to unrelated tasks never contend; the index itself is only
//! write-locked to insert or remove a task. Each `update` is written through to
//! SQLite before the in-memory copy changes, which is what makes pause/resume
//! and crash recovery work.

use crate::database::DatabaseManager;
use crate::queue::task::{DownloadTask, NewTask, StatusSet, TaskId, TaskStatus};
use crate::utils::error::{QueueError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

type TaskSlot = Arc<Mutex<DownloadTask>>;

pub struct TaskStore {
    db: DatabaseManager,
    tasks: RwLock<HashMap<TaskId, TaskSlot>>,
}

impl TaskStore {
    /// Open the store, loading every persisted task
    pub async fn open(db: DatabaseManager) -> Result<Self> {
        let records = db.get_all_tasks().await?;
        info!("Loaded {} task records", records.len());

        let tasks = records
            .into_iter()
            .map(|task| (task.id.clone(), Arc::new(Mutex::new(task))))
            .collect();

        Ok(Self {
            db,
            tasks: RwLock::new(tasks),
        })
    }

    /// Persist a new QUEUED task and return its id
    pub async fn create(&self, request: NewTask) -> Result<TaskId> {
        request.validate()?;
        let task = DownloadTask::new(request);
        let id = task.id.clone();

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(QueueError::Validation(format!("duplicate task id {}", id)));
        }
        self.db.save_task(&task).await?;
        tasks.insert(id.clone(), Arc::new(Mutex::new(task)));

        debug!("Created task {}", id);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<DownloadTask> {
        let slot = self.slot(id).await.ok()?;
        let task = slot.lock().await;
        Some(task.clone())
    }

    /// Tasks whose status is in `filter`, oldest first
    pub async fn list(&self, filter: StatusSet) -> Vec<DownloadTask> {
        let mut matching: Vec<DownloadTask> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|task| filter.contains(task.status))
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    pub async fn count(&self, status: TaskStatus) -> usize {
        self.snapshot()
            .await
            .iter()
            .filter(|task| task.status == status)
            .count()
    }

    /// Consistent view of every task: all task locks are held together,
    /// taken in id order so concurrent snapshots cannot deadlock.
    async fn snapshot(&self) -> Vec<DownloadTask> {
        let mut slots: Vec<(TaskId, TaskSlot)> = self
            .tasks
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut guards = Vec::with_capacity(slots.len());
        for (_, slot) in &slots {
            guards.push(slot.lock().await);
        }
        guards.iter().map(|task| (**task).clone()).collect()
    }

    /// Atomic, durable read-modify-write of one task.
    ///
    /// The mutator works on a copy; if it fails, or the write fails, the stored
    /// task is left as it was. Returns the mutator's value and the new task.
    pub async fn update<R, F>(&self, id: &str, mutator: F) -> Result<(R, DownloadTask)>
    where
        F: FnOnce(&mut DownloadTask) -> Result<R>,
    {
        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;

        let mut next = guard.clone();
        let value = mutator(&mut next)?;
        self.db.save_task(&next).await?;
        *guard = next.clone();

        Ok((value, next))
    }

    /// In-memory progress update between checkpoints. Not durable: after a
    /// crash the task restarts from its last checkpoint.
    pub async fn record_progress<F>(&self, id: &str, mutator: F) -> Result<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;
        mutator(&mut guard);
        Ok(guard.clone())
    }

    /// Index records another process wrote since this store was opened.
    ///
    /// Holds the index lock across the read so a concurrent `delete` cannot
    /// bring back a purged task.
    pub async fn load_new(&self) -> Result<Vec<DownloadTask>> {
        let mut tasks = self.tasks.write().await;
        let ids = self.db.get_task_ids().await?;

        let mut added = Vec::new();
        for id in ids {
            if tasks.contains_key(&id) {
                continue;
            }
            let Some(task) = self.db.get_task(&id).await? else {
                continue;
            };
            tasks.insert(id, Arc::new(Mutex::new(task.clone())));
            added.push(task);
        }

        if !added.is_empty() {
            info!("Loaded {} new task records", added.len());
        }
        Ok(added)
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    /// Remove a terminal task
    pub async fn delete(&self, id: &str) -> Result<DownloadTask> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;

        let task = slot.lock().await;
        if !task.is_terminal() {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: task.status.to_string(),
                action: "delete",
            });
        }

        self.db.delete_task(id).await?;
        tasks.remove(id);
        debug!("Deleted task {}", id);
        Ok(task.clone())
    }

    /// Reset tasks persisted as IN_PROGRESS back to QUEUED.
    ///
    /// Their worker died with the previous process, so only the checkpoint is
    /// trusted; live counters roll back to it. Call once, before scheduling.
    pub async fn recover_interrupted(&self) -> Result<Vec<TaskId>> {
        let slots: Vec<TaskSlot> = self.tasks.read().await.values().cloned().collect();

        let mut recovered = Vec::new();
        for slot in slots {
            let mut guard = slot.lock().await;
            if guard.status != TaskStatus::InProgress {
                continue;
            }
            let mut next = guard.clone();
            next.status = TaskStatus::Queued;
            next.restore_checkpoint();
            self.db.save_task(&next).await?;

            warn!(
                "Recovered interrupted task {} at unit {}/{}",
                next.id,
                next.checkpoint.units_completed,
                next.units.len()
            );
            recovered.push(next.id.clone());
            *guard = next;
        }

        Ok(recovered)
    }

    async fn slot(&self, id: &str) -> Result<TaskSlot> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::queue::task::{Checkpoint, ContentKind};
    use std::path::Path;

    async fn open_store(path: &Path) -> TaskStore {
        let pool = initialize_database(path).await.unwrap();
        TaskStore::open(DatabaseManager::new(pool)).await.unwrap()
    }

    fn request(content: &str) -> NewTask {
        NewTask::new(content, ContentKind::Manga, vec!["c1".into(), "c2".into()])
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;

        let err = store
            .create(NewTask::new("berserk", ContentKind::Manga, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = store.create(request("")).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(store.list(StatusSet::ALL).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;
        let err = store.update("missing", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_mutator_leaves_task_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;
        let id = store.create(request("berserk")).await.unwrap();

        let result = store
            .update(&id, |task| {
                task.bytes_downloaded = 99;
                task.transition(TaskStatus::Completed, "complete")
            })
            .await;
        assert!(result.is_err());

        let task = store.get(&id).await.unwrap();
        assert_eq!(task.bytes_downloaded, 0);
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir.path().join("q.db")).await);
        let id = store.create(request("berserk")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&id, |task| {
                        task.bytes_downloaded += 10;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get(&id).await.unwrap().bytes_downloaded, 160);
        drop(store);
        let store = open_store(&dir.path().join("q.db")).await;
        assert_eq!(store.get(&id).await.unwrap().bytes_downloaded, 160);
    }

    #[tokio::test]
    async fn test_load_new_picks_up_external_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.db");
        let store = open_store(&path).await;
        let own = store.create(request("berserk")).await.unwrap();

        let other = open_store(&path).await;
        let external = other.create(request("monster")).await.unwrap();
        assert!(store.get(&external).await.is_none());

        let added = store.load_new().await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, external);
        assert_eq!(store.get(&external).await.unwrap().status, TaskStatus::Queued);
        assert!(store.get(&own).await.is_some());
        assert!(store.load_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;
        let id = store.create(request("berserk")).await.unwrap();

        let err = store.delete(&id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));

        store
            .update(&id, |task| task.transition(TaskStatus::Cancelled, "cancel"))
            .await
            .unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_updates_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.db");
        let id = {
            let store = open_store(&path).await;
            let id = store.create(request("vinland")).await.unwrap();
            store
                .update(&id, |task| {
                    task.transition(TaskStatus::InProgress, "admit")?;
                    task.bytes_downloaded = 500;
                    task.checkpoint = Checkpoint {
                        units_completed: 1,
                        unit_offset: 0,
                        bytes_downloaded: 500,
                    };
                    task.retry_count = 2;
                    Ok(())
                })
                .await
                .unwrap();
            // Not durable
            store
                .record_progress(&id, |task| task.bytes_downloaded = 750)
                .await
                .unwrap();
            id
        };

        let store = open_store(&path).await;
        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.bytes_downloaded, 500);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.checkpoint.units_completed, 1);
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_and_restores_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;
        let running = store.create(request("a")).await.unwrap();
        let paused = store.create(request("b")).await.unwrap();

        store
            .update(&running, |task| {
                task.transition(TaskStatus::InProgress, "admit")?;
                task.checkpoint.bytes_downloaded = 100;
                task.bytes_downloaded = 180;
                Ok(())
            })
            .await
            .unwrap();
        store
            .update(&paused, |task| task.transition(TaskStatus::Paused, "pause"))
            .await
            .unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![running.clone()]);

        let task = store.get(&running).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.bytes_downloaded, 100);
        assert_eq!(store.get(&paused).await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("q.db")).await;
        let first = store.create(request("a")).await.unwrap();
        let second = store.create(request("b")).await.unwrap();
        store
            .update(&second, |task| task.transition(TaskStatus::Paused, "pause"))
            .await
            .unwrap();

        let all: Vec<_> = store.list(StatusSet::ALL).await.into_iter().map(|t| t.id).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], first);

        let paused = store.list(TaskStatus::Paused.into()).await;
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, second);
        assert_eq!(store.count(TaskStatus::Queued).await, 1);
    }
}
