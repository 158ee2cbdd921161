/*!
 * Queue views returned to callers.
 */

use serde::{Deserialize, Serialize};

use crate::database::models::{QueueEntryRecord, QueueStatus};

/// Queue entries bucketed by status, each bucket in display order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// By queue index
    pub waiting: Vec<QueueEntryRecord>,
    /// By start time
    pub running: Vec<QueueEntryRecord>,
    /// Most recently finished first
    pub completed: Vec<QueueEntryRecord>,
    /// Most recently finished first
    pub failed: Vec<QueueEntryRecord>,
}

impl QueueSnapshot {
    /// Bucket entries; removed entries are dropped
    pub fn from_entries(entries: Vec<QueueEntryRecord>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            match entry.status {
                QueueStatus::Waiting => snapshot.waiting.push(entry),
                QueueStatus::Running => snapshot.running.push(entry),
                QueueStatus::Completed => snapshot.completed.push(entry),
                QueueStatus::Failed => snapshot.failed.push(entry),
                QueueStatus::Removed => {}
            }
        }

        snapshot.waiting.sort_by_key(|e| e.queue_index);
        snapshot.running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshot.completed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        snapshot.failed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        snapshot
    }

    /// Total number of entries across buckets
    pub fn len(&self) -> usize {
        self.waiting.len() + self.running.len() + self.completed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
