//! The task claimer (C5): priority-ordered claiming with per-source
//! exclusivity enforced by an in-memory running-source set plus the
//! conditional `status='pending'` guarded update in `tgm_db::tasks`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tgm_common::SyncTask;
use tgm_db::Db;
use tracing::debug;

use crate::TaskError;

/// Tracks sources with an in-flight (claimed but not yet completed) task.
/// Shared between the claimer and whatever spawns/awaits the claimed
/// task's future so the source is released exactly once.
#[derive(Clone)]
pub struct RunningSources {
    inner: Arc<Mutex<HashSet<uuid::Uuid>>>,
}

impl RunningSources {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn snapshot(&self) -> Vec<uuid::Uuid> {
        self.inner.lock().iter().copied().collect()
    }

    fn reserve(&self, source_channel_id: uuid::Uuid) {
        self.inner.lock().insert(source_channel_id);
    }

    pub fn release(&self, source_channel_id: uuid::Uuid) {
        self.inner.lock().remove(&source_channel_id);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for RunningSources {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskClaimer {
    db: Db,
    running: RunningSources,
}

impl TaskClaimer {
    pub fn new(db: Db, running: RunningSources) -> Self {
        Self { db, running }
    }

    /// Attempts to claim the next eligible task, excluding sources already
    /// in `running`. Returns `None` when nothing is eligible right now.
    /// The caller is responsible for calling `running.release(source_id)`
    /// once the claimed task's worker has finished (via `lifecycle`).
    pub async fn claim_next(&self) -> Result<Option<SyncTask>, TaskError> {
        let repo = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let excluded = self.running.snapshot();
        let Some(task) = repo.claim_next(&excluded).await? else {
            return Ok(None);
        };
        self.running.reserve(task.source_channel_id);
        debug!(task_id = %task.id, source_channel_id = %task.source_channel_id, task_type = ?task.task_type, "claimed task");

        let mut notification = tgm_db::TaskNotification::new();
        notification.task_id = Some(task.id);
        notification.source_channel_id = Some(task.source_channel_id);
        notification.task_type = Some(task.task_type.as_db_str());
        notification.status = Some("running");
        self.db.notify_task_change(&notification).await;

        Ok(Some(task))
    }

    pub fn running_count(&self) -> usize {
        self.running.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_sources_reserve_and_release_round_trip() {
        let running = RunningSources::new();
        let id = uuid::Uuid::new_v4();
        assert_eq!(running.count(), 0);
        running.reserve(id);
        assert_eq!(running.count(), 1);
        assert!(running.snapshot().contains(&id));
        running.release(id);
        assert_eq!(running.count(), 0);
    }
}
