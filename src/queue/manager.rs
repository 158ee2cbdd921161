/*!
 * Task queue over the repository.
 *
 * The queue keeps a priority-ordered backlog of waiting tasks for a single
 * worker. Waiting entries always carry a dense `queue_index` 0..n-1, and at
 * most one entry is running at any time.
 */

use std::time::Duration;

use chrono::Utc;
use log::{debug, info};

use crate::database::models::{QueueEntryRecord, QueueStatus};
use crate::database::{QueueStatusPatch, QueueUpdate, Repository};
use crate::errors::QueueError;

use super::models::QueueSnapshot;

/// Task queue backed by persistent storage
#[derive(Clone)]
pub struct TaskQueue {
    repo: Repository,
}

impl TaskQueue {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Append a task to the waiting tail
    pub async fn enqueue(
        &self,
        task_id: &str,
        batch_id: Option<&str>,
        priority: i64,
    ) -> Result<QueueEntryRecord, QueueError> {
        if self.repo.get_task(task_id).await?.is_none() {
            return Err(QueueError::UnknownTask(task_id.to_string()));
        }

        let entry = self
            .repo
            .enqueue_entry(task_id, batch_id, priority)
            .await?
            .ok_or_else(|| QueueError::Duplicate(task_id.to_string()))?;

        info!(
            "Enqueued task {} at index {} (priority {})",
            task_id,
            entry.queue_index.unwrap_or_default(),
            priority
        );
        Ok(entry)
    }

    /// Up to `limit` waiting entries, highest priority first, FIFO within a tier
    ///
    /// This only peeks; the caller claims an entry by moving it to `running`.
    pub async fn dequeue_next(&self, limit: usize) -> Result<Vec<QueueEntryRecord>, QueueError> {
        Ok(self.repo.next_waiting_entries(limit).await?)
    }

    /// Transition an entry to a new status
    pub async fn update_queue_status(
        &self,
        task_id: &str,
        status: QueueStatus,
        patch: QueueStatusPatch,
    ) -> Result<QueueEntryRecord, QueueError> {
        match self.repo.update_queue_status(task_id, status, patch).await? {
            QueueUpdate::Updated(entry) => {
                debug!("Queue entry {} is now {}", task_id, status);
                Ok(entry)
            }
            QueueUpdate::NotFound => Err(QueueError::NotFound(task_id.to_string())),
            QueueUpdate::Busy(running) => Err(QueueError::AlreadyRunning {
                running,
                requested: task_id.to_string(),
            }),
        }
    }

    /// Move a waiting task to `to_index` (clamped) and return the new waiting order
    pub async fn reorder(
        &self,
        task_id: &str,
        to_index: i64,
    ) -> Result<Vec<QueueEntryRecord>, QueueError> {
        match self.repo.reorder_waiting(task_id, to_index).await? {
            Some(waiting) => Ok(waiting),
            None => Err(self.not_waiting_error(task_id).await?),
        }
    }

    /// Mark a waiting task removed
    pub async fn remove_waiting_task(&self, task_id: &str) -> Result<QueueEntryRecord, QueueError> {
        let entry = self
            .repo
            .get_queue_entry(task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if entry.status != QueueStatus::Waiting {
            return Err(QueueError::NotWaiting(task_id.to_string()));
        }

        info!("Removing task {} from the queue", task_id);
        self.update_queue_status(task_id, QueueStatus::Removed, QueueStatusPatch::default())
            .await
    }

    /// Running entries with no sign of life within `timeout`
    pub async fn list_stale_running_tasks(
        &self,
        timeout: Duration,
    ) -> Result<Vec<QueueEntryRecord>, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let running = self.repo.list_queue_entries(QueueStatus::Running).await?;
        Ok(running
            .into_iter()
            .filter(|entry| match entry.last_activity() {
                Some(last) => last < cutoff,
                None => true,
            })
            .collect())
    }

    /// Move entries to the waiting tail in the given order, returning the moved ids
    pub async fn requeue_tasks(&self, task_ids: &[String]) -> Result<Vec<String>, QueueError> {
        let moved = self.repo.requeue_entries(task_ids).await?;
        if !moved.is_empty() {
            info!("Requeued {} task(s)", moved.len());
        }
        Ok(moved)
    }

    /// Move one entry to the waiting tail
    pub async fn move_to_waiting_tail(&self, task_id: &str) -> Result<(), QueueError> {
        let moved = self.requeue_tasks(&[task_id.to_string()]).await?;
        if moved.is_empty() {
            return Err(QueueError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Refresh a running entry's heartbeat; false when the entry is not running
    pub async fn heartbeat(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self.repo.touch_heartbeat(task_id).await?)
    }

    /// Get an entry
    pub async fn get_entry(&self, task_id: &str) -> Result<Option<QueueEntryRecord>, QueueError> {
        Ok(self.repo.get_queue_entry(task_id).await?)
    }

    /// All entries bucketed by status, read in one statement
    pub async fn get_snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let entries = self.repo.list_all_queue_entries().await?;
        Ok(QueueSnapshot::from_entries(entries))
    }

    async fn not_waiting_error(&self, task_id: &str) -> Result<QueueError, QueueError> {
        Ok(match self.repo.get_queue_entry(task_id).await? {
            Some(_) => QueueError::NotWaiting(task_id.to_string()),
            None => QueueError::NotFound(task_id.to_string()),
        })
    }
}
