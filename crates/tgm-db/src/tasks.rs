//! Repository for `sync_task`: the C4 lifecycle mutators, the C5 claim
//! query, and the C10 scheduler queries.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tgm_common::{SyncTask, TaskStatus, TaskType};

use crate::retry::with_retry;

fn row_to_task(row: &PgRow) -> SyncTask {
    SyncTask {
        id: row.get("id"),
        source_channel_id: row.get("source_channel_id"),
        task_type: TaskType::from_db_str(row.get::<String, _>("task_type").as_str())
            .unwrap_or(TaskType::Realtime),
        status: TaskStatus::from_db_str(row.get::<String, _>("status").as_str())
            .unwrap_or(TaskStatus::Pending),
        created_at: row.get("created_at"),
        started_at: row.try_get("started_at").ok(),
        paused_at: row.try_get("paused_at").ok(),
        completed_at: row.try_get("completed_at").ok(),
        progress_current: row.try_get("progress_current").ok(),
        progress_total: row.try_get("progress_total").ok(),
        last_processed_id: row.try_get("last_processed_id").ok(),
        last_error: row.try_get("last_error").ok(),
    }
}

pub struct TaskRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> TaskRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: uuid::Uuid) -> Result<Option<SyncTask>, sqlx::Error> {
        with_retry("task.find_by_id", || async {
            sqlx::query("SELECT * FROM sync_task WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool)
                .await
        })
        .await
        .map(|opt| opt.as_ref().map(row_to_task))
    }

    /// Creates a new `pending` task, unless an equivalent task already
    /// exists in a non-terminal state for the same source (per-source
    /// exclusivity is enforced at claim time, not here).
    pub async fn create(&self, source_channel_id: uuid::Uuid, task_type: TaskType) -> Result<uuid::Uuid, sqlx::Error> {
        let row: (uuid::Uuid,) = with_retry("task.create", || async {
            sqlx::query_as(
                "INSERT INTO sync_task (source_channel_id, task_type, status) \
                 VALUES ($1, $2, 'pending') RETURNING id",
            )
            .bind(source_channel_id)
            .bind(task_type.as_db_str())
            .fetch_one(self.pool)
            .await
        })
        .await?;
        Ok(row.0)
    }

    /// The C5 claim query: picks the highest-priority eligible pending task
    /// not already running for its source, and atomically flips it to
    /// `running`. Eligibility requires the source to be active and not
    /// suppressed by a health-check error, and (for anything but a
    /// `resolve` task) both the source and mirror numeric ids to already be
    /// resolved. Priority order is `resolve` > `history_full` > everything
    /// else, then `source_channel.priority DESC`, then oldest `created_at`
    /// first. Returns `None` when nothing is eligible. The
    /// `excluded_sources` set enforces per-source exclusivity against tasks
    /// this process already has in flight.
    pub async fn claim_next(&self, excluded_sources: &[uuid::Uuid]) -> Result<Option<SyncTask>, sqlx::Error> {
        let row = with_retry("task.claim_next", || async {
            sqlx::query(
                "UPDATE sync_task t SET status = 'running', started_at = now() \
                 WHERE t.id = ( \
                     SELECT t2.id FROM sync_task t2 \
                     JOIN source_channel sc ON sc.id = t2.source_channel_id \
                     LEFT JOIN mirror_channel mc ON mc.source_channel_id = sc.id \
                     WHERE t2.status = 'pending' \
                         AND NOT (t2.source_channel_id = ANY($1)) \
                         AND sc.is_active = true \
                         AND sc.sync_status <> 'error' \
                         AND (t2.task_type = 'resolve' OR (sc.numeric_id IS NOT NULL AND mc.numeric_id IS NOT NULL)) \
                     ORDER BY \
                         CASE t2.task_type \
                             WHEN 'resolve' THEN 0 \
                             WHEN 'history_full' THEN 1 \
                             WHEN 'retry_failed' THEN 2 \
                             ELSE 3 \
                         END, \
                         sc.priority DESC, \
                         t2.created_at ASC \
                     FOR UPDATE OF t2 SKIP LOCKED LIMIT 1 \
                 ) \
                 AND t.status = 'pending' \
                 RETURNING t.*",
            )
            .bind(excluded_sources)
            .fetch_optional(self.pool)
            .await
        })
        .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    pub async fn update_progress(
        &self,
        id: uuid::Uuid,
        progress_current: i64,
        progress_total: Option<i64>,
        last_processed_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        with_retry("task.update_progress", || async {
            sqlx::query(
                "UPDATE sync_task SET progress_current = $2, progress_total = $3, \
                 last_processed_id = COALESCE($4, last_processed_id) WHERE id = $1",
            )
            .bind(id)
            .bind(progress_current)
            .bind(progress_total)
            .bind(last_processed_id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn pause(&self, id: uuid::Uuid, reason: &str) -> Result<Option<SyncTask>, sqlx::Error> {
        let prior = self.find_by_id(id).await?;
        with_retry("task.pause", || async {
            sqlx::query(
                "UPDATE sync_task SET status = 'paused', paused_at = now(), last_error = $2 \
                 WHERE id = $1 AND status NOT IN ('failed', 'completed')",
            )
            .bind(id)
            .bind(reason)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(prior)
    }

    pub async fn resume(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        with_retry("task.resume", || async {
            sqlx::query("UPDATE sync_task SET status = 'pending', paused_at = NULL WHERE id = $1 AND status = 'paused'")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn fail(&self, id: uuid::Uuid, error: &str) -> Result<Option<SyncTask>, sqlx::Error> {
        let prior = self.find_by_id(id).await?;
        with_retry("task.fail", || async {
            sqlx::query(
                "UPDATE sync_task SET status = 'failed', completed_at = now(), last_error = $2 \
                 WHERE id = $1 AND status <> 'completed'",
            )
            .bind(id)
            .bind(error)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(prior)
    }

    pub async fn complete(&self, id: uuid::Uuid) -> Result<Option<SyncTask>, sqlx::Error> {
        let prior = self.find_by_id(id).await?;
        with_retry("task.complete", || async {
            sqlx::query(
                "UPDATE sync_task SET status = 'completed', completed_at = now() \
                 WHERE id = $1 AND status <> 'completed'",
            )
            .bind(id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(prior)
    }

    /// Tasks paused on a `FLOOD_WAIT` whose wait has elapsed, eligible for
    /// the C10 auto-resume scheduler (≥5s tick).
    pub async fn flood_wait_expired(&self, now_plus_grace: chrono::DateTime<chrono::Utc>) -> Result<Vec<SyncTask>, sqlx::Error> {
        let rows = with_retry("task.flood_wait_expired", || async {
            sqlx::query(
                "SELECT * FROM sync_task WHERE status = 'paused' AND last_error LIKE 'FLOOD_WAIT:%' \
                 AND paused_at + (split_part(last_error, ':', 2) || ' seconds')::interval <= $1",
            )
            .bind(now_plus_grace)
            .fetch_all(self.pool)
            .await
        })
        .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// Failed tasks eligible for a fresh `retry_failed` task, per the C10
    /// retry-task creator (≥10s tick), bounded by the operator's configured
    /// retry interval and max retry count (enforced by the caller, which
    /// tracks the per-source retry count separately).
    pub async fn failed_ready_for_retry(
        &self,
        retry_interval_sec: i64,
    ) -> Result<Vec<SyncTask>, sqlx::Error> {
        let rows = with_retry("task.failed_ready_for_retry", || async {
            sqlx::query(
                "SELECT * FROM sync_task WHERE status = 'failed' \
                 AND completed_at <= now() - ($1 || ' seconds')::interval \
                 AND task_type <> 'retry_failed'",
            )
            .bind(retry_interval_sec)
            .fetch_all(self.pool)
            .await
        })
        .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// The most recently created task of a given type for a source, used by
    /// the C10 schedulers to decide whether to insert or revive a
    /// `retry_failed` task and to derive a recovered `sync_status` from the
    /// latest `history_full` task.
    pub async fn find_latest_by_source_and_type(
        &self,
        source_channel_id: uuid::Uuid,
        task_type: TaskType,
    ) -> Result<Option<SyncTask>, sqlx::Error> {
        let row = with_retry("task.find_latest_by_source_and_type", || async {
            sqlx::query(
                "SELECT * FROM sync_task WHERE source_channel_id = $1 AND task_type = $2 \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(source_channel_id)
            .bind(task_type.as_db_str())
            .fetch_optional(self.pool)
            .await
        })
        .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    /// Revives a terminal (`failed`/`completed`) task back to a fresh
    /// `pending` run by resetting its progress fields, instead of inserting
    /// a duplicate row for the same source.
    pub async fn revive(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        with_retry("task.revive", || async {
            sqlx::query(
                "UPDATE sync_task SET status = 'pending', started_at = NULL, paused_at = NULL, \
                 completed_at = NULL, progress_current = NULL, progress_total = NULL, \
                 last_processed_id = NULL, last_error = NULL \
                 WHERE id = $1 AND status NOT IN ('pending', 'running', 'paused')",
            )
            .bind(id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Resets every `running` task back to `pending` (C12 crash recovery).
    /// A task left `running` means the process exited mid-claim, not that
    /// the work finished; re-queuing lets the claimer pick it up again
    /// rather than leaving it stuck forever.
    pub async fn requeue_running(&self) -> Result<u64, sqlx::Error> {
        let result = with_retry("task.requeue_running", || async {
            sqlx::query("UPDATE sync_task SET status = 'pending', started_at = NULL WHERE status = 'running'")
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_priority_ordering_matches_claim_query() {
        let order = ["resolve", "history_full", "retry_failed", "realtime"];
        assert_eq!(order[0], TaskType::Resolve.as_db_str());
        assert_eq!(order[1], TaskType::HistoryFull.as_db_str());
    }
}
