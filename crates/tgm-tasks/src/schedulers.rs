//! The three ensure-loops (C10), each gated by its own minimum interval
//! and invoked from the supervisor tick rather than running its own
//! `tokio::spawn` loop — the supervisor is the single scheduling loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tgm_common::{EventLevel, SyncStatus, TaskStatus, TaskType};
use tgm_db::settings::SettingsCache;
use tgm_db::Db;
use tgm_telegram::{is_inaccessible, ChatClient, ChannelRef};
use tracing::{debug, info, warn};

use crate::TaskError;

const RETRY_CREATOR_MIN_INTERVAL: Duration = Duration::from_secs(10);
const FLOOD_WAIT_RESUME_MIN_INTERVAL: Duration = Duration::from_secs(5);

struct Gate {
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Gate {
    fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_run: Mutex::new(None) }
    }

    fn ready(&self) -> bool {
        let mut last = self.last_run.lock();
        let ready = last.map(|t| t.elapsed() >= self.min_interval).unwrap_or(true);
        if ready {
            *last = Some(Instant::now());
        }
        ready
    }
}

pub struct Schedulers {
    db: Db,
    chat: Arc<ChatClient>,
    settings: Arc<SettingsCache>,
    retry_gate: Gate,
    flood_wait_gate: Gate,
    health_gate: Gate,
    health_refresh_gate: Gate,
}

impl Schedulers {
    pub fn new(
        db: Db,
        chat: Arc<ChatClient>,
        settings: Arc<SettingsCache>,
        health_interval_sec: u64,
        health_refresh_sec: u64,
    ) -> Self {
        Self {
            db,
            chat,
            settings,
            retry_gate: Gate::new(RETRY_CREATOR_MIN_INTERVAL),
            flood_wait_gate: Gate::new(FLOOD_WAIT_RESUME_MIN_INTERVAL),
            health_gate: Gate::new(Duration::from_secs(health_interval_sec)),
            health_refresh_gate: Gate::new(Duration::from_secs(health_refresh_sec)),
        }
    }

    /// Runs every ensure-loop whose minimum interval has elapsed. Cheap to
    /// call every supervisor tick.
    pub async fn tick(&self) -> Result<(), TaskError> {
        if self.retry_gate.ready() {
            let retry = self.settings.retry().await;
            self.ensure_retry_tasks(retry.retry_interval_sec as i64, retry.max_retry_count as i32).await?;
        }
        if self.flood_wait_gate.ready() {
            self.ensure_flood_wait_resume().await?;
        }
        if self.health_gate.ready() {
            self.ensure_channel_health().await?;
        }
        Ok(())
    }

    /// Creates a `retry_failed` task for every source with mappings stuck
    /// below `max_retry_count`. A source whose most recent retry task is
    /// still pending/running/paused is left alone; a terminal one (failed,
    /// completed, or skipped for having nothing eligible) is revived in
    /// place instead of piling up a new row per tick.
    async fn ensure_retry_tasks(&self, retry_interval_sec: i64, max_retry_count: i32) -> Result<(), TaskError> {
        let tasks = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let mappings = tgm_db::mappings::MappingRepo::new(&self.db.pool);
        let failed = tasks.failed_ready_for_retry(retry_interval_sec).await?;
        for task in failed {
            let eligible = mappings.retry_eligible(task.source_channel_id, max_retry_count, None, 1).await?;
            if eligible.is_empty() {
                continue;
            }
            match tasks.find_latest_by_source_and_type(task.source_channel_id, TaskType::RetryFailed).await? {
                Some(existing) if matches!(existing.status, TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused) => {
                    continue;
                }
                Some(existing) => {
                    tasks.revive(existing.id).await?;
                    info!(source_channel_id = %task.source_channel_id, task_id = %existing.id, "revived retry_failed task");
                }
                None => {
                    let created = tasks.create(task.source_channel_id, TaskType::RetryFailed).await?;
                    info!(source_channel_id = %task.source_channel_id, task_id = %created, "created retry_failed task");
                }
            }
        }
        Ok(())
    }

    async fn ensure_flood_wait_resume(&self) -> Result<(), TaskError> {
        let tasks = tgm_db::tasks::TaskRepo::new(&self.db.pool);
        let expired = tasks.flood_wait_expired(chrono::Utc::now()).await?;
        let events = tgm_db::events::EventRepo::new(&self.db.pool);
        for task in expired {
            tasks.resume(task.id).await?;
            events
                .record(EventLevel::Info, "flood wait elapsed, task resumed", Some(task.source_channel_id))
                .await?;
            debug!(task_id = %task.id, "flood wait auto-resumed");
        }
        Ok(())
    }

    async fn ensure_channel_health(&self) -> Result<(), TaskError> {
        let sources = tgm_db::sources::SourceRepo::new(&self.db.pool);
        let refresh_list = self.health_refresh_gate.ready();
        let limit = if refresh_list { 100 } else { 20 };
        let active = sources.active_resolved_sources(limit).await?;

        for source in active {
            let (Some(numeric_id), Some(access_hash)) = (source.numeric_id, source.access_hash) else {
                continue;
            };
            let channel = ChannelRef::new(numeric_id, access_hash);
            match self.chat.fetch_full_channel(channel).await {
                Ok(full) => {
                    let about = if full.about.is_empty() { None } else { Some(full.about.as_str()) };
                    sources
                        .update_health_metadata(
                            source.id,
                            about,
                            full.participants_count.map(i64::from),
                            full.noforwards,
                            None,
                            None,
                            None,
                        )
                        .await?;
                    if source.sync_status == SyncStatus::Error {
                        let tasks = tgm_db::tasks::TaskRepo::new(&self.db.pool);
                        let recovered = tasks
                            .find_latest_by_source_and_type(source.id, TaskType::HistoryFull)
                            .await?
                            .map(|t| match t.status {
                                TaskStatus::Completed => SyncStatus::Completed,
                                TaskStatus::Running | TaskStatus::Paused => SyncStatus::Syncing,
                                TaskStatus::Pending | TaskStatus::Failed => SyncStatus::Pending,
                            })
                            .unwrap_or(SyncStatus::Pending);
                        sources.mark_sync_status(source.id, recovered).await?;
                        info!(source_channel_id = %source.id, recovered = ?recovered, "channel recovered from error state");
                    }
                }
                Err(err) => {
                    let inaccessible = err.code().map(is_inaccessible).unwrap_or(false);
                    if inaccessible && source.sync_status != SyncStatus::Error {
                        sources.mark_sync_status(source.id, SyncStatus::Error).await?;
                        warn!(source_channel_id = %source.id, error = %err, "channel inaccessible, marked error");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_permits_first_call_then_blocks_until_interval() {
        let gate = Gate::new(Duration::from_secs(3600));
        assert!(gate.ready());
        assert!(!gate.ready());
    }
}
