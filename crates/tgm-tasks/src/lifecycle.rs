//! Task lifecycle mutators (C4): `pause`, `fail`, `complete`.
//!
//! Each mutator returns the prior row so the caller can decide what event
//! text to emit, and notifies `LISTEN/NOTIFY` listeners on every
//! transition.

use tgm_common::{EventLevel, SyncStatus, TaskType};
use tgm_db::{Db, TaskNotification};
use tracing::{error, warn};

use crate::TaskError;

pub struct TaskLifecycle {
    db: Db,
}

impl TaskLifecycle {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn pause(&self, task_id: uuid::Uuid, reason: &str) -> Result<(), TaskError> {
        let repo = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let prior = repo.pause(task_id, reason).await?;

        let mut notification = TaskNotification::new();
        notification.task_id = Some(task_id);
        notification.status = Some("paused");
        if let Some(prior) = &prior {
            notification.source_channel_id = Some(prior.source_channel_id);
            notification.task_type = Some(prior.task_type.as_db_str());
        }
        self.db.notify_task_change(&notification).await;

        let events = tgm_db::events::EventRepo::new(&self.db.pool);
        let source_channel_id = prior.as_ref().map(|p| p.source_channel_id);
        events
            .record(EventLevel::Warn, &format!("task paused: {reason}"), source_channel_id)
            .await?;

        warn!(task_id = %task_id, reason, "task paused");
        Ok(())
    }

    pub async fn fail(&self, task_id: uuid::Uuid, error: &str) -> Result<(), TaskError> {
        let repo = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let prior = repo.fail(task_id, error).await?;

        if let Some(prior) = &prior {
            if matches!(prior.task_type, TaskType::Resolve | TaskType::HistoryFull) {
                let sources = tgm_db::sources::SourceRepo::new(&self.db.pool);
                sources.mark_sync_status(prior.source_channel_id, SyncStatus::Error).await?;
            }
        }

        let mut notification = TaskNotification::new();
        notification.task_id = Some(task_id);
        notification.status = Some("failed");
        if let Some(prior) = &prior {
            notification.source_channel_id = Some(prior.source_channel_id);
            notification.task_type = Some(prior.task_type.as_db_str());
        }
        self.db.notify_task_change(&notification).await;

        let events = tgm_db::events::EventRepo::new(&self.db.pool);
        let source_channel_id = prior.as_ref().map(|p| p.source_channel_id);
        events
            .record(EventLevel::Error, &format!("task failed: {error}"), source_channel_id)
            .await?;

        error!(task_id = %task_id, error, "task failed");
        Ok(())
    }

    pub async fn complete(&self, task_id: uuid::Uuid) -> Result<(), TaskError> {
        let repo = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let prior = repo.complete(task_id).await?;

        let mut notification = TaskNotification::new();
        notification.task_id = Some(task_id);
        notification.status = Some("completed");
        if let Some(prior) = &prior {
            notification.source_channel_id = Some(prior.source_channel_id);
            notification.task_type = Some(prior.task_type.as_db_str());
        }
        self.db.notify_task_change(&notification).await;

        Ok(())
    }
}
