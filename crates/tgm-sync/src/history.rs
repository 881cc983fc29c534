//! The history-backfill worker (C7): a resumable ascending scan over a
//! channel's message history, batching by media group and flushing each
//! batch through the chat-service adapter.

use std::time::{Duration, Instant};

use tgm_common::{MessageType, MirrorMode, SkipReason, TaskStatus};
use tgm_db::{events::EventRepo, mappings::MappingRepo, sources::SourceRepo, tasks::TaskRepo, Db};
use tgm_tasks::TaskLifecycle;
use tgm_telegram::{ChannelRef, ChatClient, ChatError, RawMessage};
use tracing::{info, warn};

use crate::comment_anchor::post_comment_anchor;
use crate::dedupe::SyncDedup;
use crate::filter::{effective_keywords, policy_skip_reason};

const SCAN_BATCH_LIMIT: i32 = 100;
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_FLUSH_STEP: i64 = 50;
const COOPERATIVE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_STALE_ROUNDS: u32 = 2;

pub struct HistoryBackfillConfig {
    pub skip_protected_content: bool,
    pub mirror_interval_ms: u64,
    pub flood_wait_max_sec: u32,
    pub max_file_size_bytes: i64,
    pub skip_video_messages: bool,
    pub filter_enabled: bool,
    pub filter_keywords: Vec<String>,
}

struct HistoryWorker<'a> {
    db: &'a Db,
    chat: &'a ChatClient,
    dedup: &'a SyncDedup,
    task_id: uuid::Uuid,
    source_id: uuid::Uuid,
    config: HistoryBackfillConfig,
    progress_current: i64,
    last_progress_write: Instant,
    last_progress_value: i64,
    last_cooperative_check: Instant,
}

/// Runs the C7 state machine for a `history_full` task until it completes,
/// pauses (flood wait / protected content / cooperative stop), or fails.
pub async fn run_history_backfill(
    db: &Db,
    chat: &ChatClient,
    dedup: &SyncDedup,
    task_id: uuid::Uuid,
    source_id: uuid::Uuid,
    config: HistoryBackfillConfig,
) -> anyhow::Result<()> {
    let mut worker = HistoryWorker {
        db,
        chat,
        dedup,
        task_id,
        source_id,
        config,
        progress_current: 0,
        last_progress_write: Instant::now(),
        last_progress_value: 0,
        last_cooperative_check: Instant::now(),
    };
    worker.run().await
}

impl<'a> HistoryWorker<'a> {
    async fn run(&mut self) -> anyhow::Result<()> {
        let sources = SourceRepo::new(&self.db.pool);
        let tasks = TaskRepo::new(&self.db.pool);
        let lifecycle = TaskLifecycle::new(self.db.clone());

        let Some(source) = sources.find_by_id(self.source_id).await? else {
            lifecycle.fail(self.task_id, "source channel no longer exists").await?;
            return Ok(());
        };
        let (Some(src_numeric), Some(src_hash)) = (source.numeric_id, source.access_hash) else {
            lifecycle.fail(self.task_id, "source channel not resolved").await?;
            return Ok(());
        };
        let Some(mirror) = sources.mirror_for_source(self.source_id).await? else {
            lifecycle.fail(self.task_id, "mirror channel missing").await?;
            return Ok(());
        };
        let (Some(mirror_numeric), Some(mirror_hash)) = (mirror.numeric_id, mirror.access_hash) else {
            lifecycle.pause(self.task_id, "mirror channel not yet resolved").await?;
            return Ok(());
        };

        let source_ref = ChannelRef::new(src_numeric, src_hash);
        let mirror_ref = ChannelRef::new(mirror_numeric, mirror_hash);

        let task = tasks
            .find_by_id(self.task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("history_full task vanished"))?;
        self.progress_current = task.progress_current.unwrap_or(0);
        self.last_progress_value = self.progress_current;
        let mut last_processed_id = task.last_processed_id.unwrap_or(0);

        if task.progress_total.is_none() {
            let total = self.chat.get_total_message_count(source_ref).await.unwrap_or(0);
            tasks.update_progress(self.task_id, self.progress_current, Some(total), None).await?;
            info!(task_id = %self.task_id, total, "seeded progress_total for history backfill");
        }

        let mut stale_rounds = 0u32;
        loop {
            if let Some(reason) = self.cooperative_stop_reason(&sources, &tasks).await? {
                self.persist_progress(&tasks, last_processed_id, true).await?;
                lifecycle.pause(self.task_id, &reason).await.ok();
                return Ok(());
            }

            let batch = self.chat.get_history(source_ref, last_processed_id, 0, SCAN_BATCH_LIMIT).await?;
            if batch.is_empty() {
                let probe = self.chat.get_history(source_ref, last_processed_id, 0, 1).await?;
                if probe.is_empty() {
                    self.persist_progress(&tasks, last_processed_id, true).await?;
                    lifecycle.complete(self.task_id).await?;
                    info!(task_id = %self.task_id, "history backfill completed");
                    return Ok(());
                }
                continue;
            }

            let before = last_processed_id;
            let outcome = self
                .process_round(&sources, &source, source_ref, mirror_ref, &batch, &mut last_processed_id)
                .await?;
            self.persist_progress(&tasks, last_processed_id, false).await?;

            match outcome {
                RoundOutcome::Paused(reason) => {
                    lifecycle.pause(self.task_id, &reason).await.ok();
                    return Ok(());
                }
                RoundOutcome::Continue => {}
            }

            if last_processed_id == before {
                stale_rounds += 1;
                if stale_rounds >= MAX_STALE_ROUNDS {
                    self.persist_progress(&tasks, last_processed_id, true).await?;
                    lifecycle.pause(self.task_id, "no forward progress for two consecutive rounds").await.ok();
                    return Ok(());
                }
            } else {
                stale_rounds = 0;
            }
        }
    }

    async fn cooperative_stop_reason(
        &mut self,
        sources: &SourceRepo<'_>,
        tasks: &TaskRepo<'_>,
    ) -> anyhow::Result<Option<String>> {
        if self.last_cooperative_check.elapsed() < COOPERATIVE_CHECK_INTERVAL {
            return Ok(None);
        }
        self.last_cooperative_check = Instant::now();

        let task = tasks.find_by_id(self.task_id).await?;
        if let Some(task) = task {
            if task.status != TaskStatus::Running {
                return Ok(Some(format!("task externally transitioned to {:?}", task.status)));
            }
        }
        let source = sources.find_by_id(self.source_id).await?;
        if let Some(source) = source {
            if !source.is_active {
                return Ok(Some("source deactivated".to_string()));
            }
        }
        Ok(None)
    }

    async fn persist_progress(
        &mut self,
        tasks: &TaskRepo<'_>,
        last_processed_id: i32,
        force: bool,
    ) -> anyhow::Result<()> {
        let advanced_enough = self.progress_current - self.last_progress_value >= PROGRESS_FLUSH_STEP;
        let time_elapsed = self.last_progress_write.elapsed() >= PROGRESS_FLUSH_INTERVAL;
        if !force && !advanced_enough && !time_elapsed {
            return Ok(());
        }
        tasks
            .update_progress(self.task_id, self.progress_current, None, Some(last_processed_id as i64))
            .await?;
        self.last_progress_write = Instant::now();
        self.last_progress_value = self.progress_current;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_round(
        &mut self,
        sources: &SourceRepo<'_>,
        source: &tgm_common::SourceChannel,
        source_ref: ChannelRef,
        mirror_ref: ChannelRef,
        batch: &[RawMessage],
        last_processed_id: &mut i32,
    ) -> anyhow::Result<RoundOutcome> {
        let mappings = MappingRepo::new(&self.db.pool);
        let max_file_size_bytes = self.config.max_file_size_bytes;
        let filter_settings = tgm_db::settings::MessageFilterSettings {
            enabled: self.config.filter_enabled,
            keywords: self.config.filter_keywords.clone(),
        };
        let keywords = effective_keywords(source, &filter_settings);

        for group in group_by_media(batch) {
            let mut mapping_ids = Vec::with_capacity(group.len());
            let mut forwardable_ids = Vec::with_capacity(group.len());
            let mut forwardable_msgs: Vec<&RawMessage> = Vec::with_capacity(group.len());

            for msg in &group {
                let mapping_id = mappings
                    .upsert_pending(
                        self.source_id,
                        msg.id as i64,
                        classify_message_type(msg),
                        msg.grouped_id.map(|g| g.to_string()).as_deref(),
                        msg.has_media,
                        msg.file_size,
                        if msg.text.is_empty() { None } else { Some(msg.text.as_str()) },
                        chrono::DateTime::from_timestamp(msg.date as i64, 0).unwrap_or_else(chrono::Utc::now),
                    )
                    .await?;

                if let Some(reason) = pre_skip_reason(msg, max_file_size_bytes, self.config.skip_video_messages, &keywords) {
                    mappings.mark_skipped(mapping_id, reason).await?;
                } else {
                    mapping_ids.push(mapping_id);
                    forwardable_ids.push(msg.id);
                    forwardable_msgs.push(msg);
                }
                self.progress_current += 1;
                *last_processed_id = (*last_processed_id).max(msg.id);
            }

            if forwardable_ids.is_empty() {
                continue;
            }

            match source.mirror_mode {
                MirrorMode::Forward => {
                    let outcome = self
                        .flush_forward_batch(sources, source, source_ref, mirror_ref, &mapping_ids, &forwardable_ids)
                        .await?;
                    if let RoundOutcome::Paused(_) = outcome {
                        return Ok(outcome);
                    }
                }
                MirrorMode::Copy => {
                    for (mapping_id, msg) in mapping_ids.iter().zip(forwardable_msgs.iter()) {
                        if msg.text.is_empty() {
                            mappings.mark_skipped(*mapping_id, SkipReason::UnsupportedType).await?;
                            continue;
                        }
                        match self.chat.send_text(mirror_ref, &msg.text).await {
                            Ok(mirror_id) => {
                                mappings.mark_success(*mapping_id, mirror_id as i64).await?;
                                post_comment_anchor(self.db, self.chat, self.dedup, source, mirror_id).await;
                            }
                            Err(e) => {
                                if let Some(outcome) = self
                                    .handle_flush_error(sources, source.id, &e, &[*mapping_id])
                                    .await?
                                {
                                    return Ok(outcome);
                                }
                            }
                        }
                        if self.config.mirror_interval_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(self.config.mirror_interval_ms)).await;
                        }
                    }
                }
            }
        }
        Ok(RoundOutcome::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn flush_forward_batch(
        &mut self,
        sources: &SourceRepo<'_>,
        source: &tgm_common::SourceChannel,
        source_ref: ChannelRef,
        mirror_ref: ChannelRef,
        mapping_ids: &[uuid::Uuid],
        message_ids: &[i32],
    ) -> anyhow::Result<RoundOutcome> {
        match self.chat.forward_as_copy(source_ref, mirror_ref, message_ids).await {
            Ok(results) => {
                let mappings = MappingRepo::new(&self.db.pool);
                let events = EventRepo::new(&self.db.pool);
                let mut last_mirror_id = None;
                for (mapping_id, mirror_msg_id) in mapping_ids.iter().zip(results.into_iter()) {
                    match mirror_msg_id {
                        Some(id) => {
                            mappings.mark_success(*mapping_id, id as i64).await?;
                            last_mirror_id = Some(id);
                        }
                        None => {
                            warn!(source_channel_id = %source.id, mapping_id = %mapping_id, "forward did not return a mirror id for this message, recording best-effort");
                            mappings.mark_failed(*mapping_id, "forward did not return a mirror id for this message").await?;
                            events
                                .record(
                                    tgm_common::EventLevel::Warn,
                                    "forward returned an incomplete mirror id for a batch message",
                                    Some(source.id),
                                )
                                .await?;
                        }
                    }
                }
                if let Some(id) = last_mirror_id {
                    post_comment_anchor(self.db, self.chat, self.dedup, source, id).await;
                }
                if self.config.mirror_interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.config.mirror_interval_ms)).await;
                }
                Ok(RoundOutcome::Continue)
            }
            Err(e) => self
                .handle_flush_error(sources, source.id, &e, mapping_ids)
                .await
                .map(|opt| opt.unwrap_or(RoundOutcome::Continue)),
        }
    }

    async fn handle_flush_error(
        &self,
        sources: &SourceRepo<'_>,
        source_id: uuid::Uuid,
        error: &ChatError,
        mapping_ids: &[uuid::Uuid],
    ) -> anyhow::Result<Option<RoundOutcome>> {
        let mappings = MappingRepo::new(&self.db.pool);
        let events = EventRepo::new(&self.db.pool);
        match error {
            ChatError::ProtectedContent => {
                sources.mark_protected(source_id).await?;
                if self.config.skip_protected_content {
                    for id in mapping_ids {
                        mappings.mark_skipped(*id, SkipReason::ProtectedContent).await?;
                    }
                    events
                        .record(tgm_common::EventLevel::Warn, "batch skipped: protected content", Some(source_id))
                        .await?;
                    Ok(None)
                } else {
                    for id in mapping_ids {
                        mappings.mark_failed(*id, "protected_content").await?;
                    }
                    Ok(Some(RoundOutcome::Paused("protected content, skip disabled".to_string())))
                }
            }
            ChatError::FloodWait(secs) => {
                if *secs <= self.config.flood_wait_max_sec {
                    tokio::time::sleep(Duration::from_secs(*secs as u64 + 1)).await;
                    Ok(None)
                } else {
                    Ok(Some(RoundOutcome::Paused(format!("FLOOD_WAIT:{secs}"))))
                }
            }
            other => {
                for id in mapping_ids {
                    mappings.mark_failed(*id, &other.to_string()).await?;
                }
                Ok(Some(RoundOutcome::Paused(other.to_string())))
            }
        }
    }
}

enum RoundOutcome {
    Continue,
    Paused(String),
}

fn classify_message_type(msg: &RawMessage) -> MessageType {
    if !msg.has_media {
        MessageType::Text
    } else if msg.is_video {
        MessageType::Video
    } else {
        MessageType::Other
    }
}

fn pre_skip_reason(
    msg: &RawMessage,
    max_file_size_bytes: i64,
    skip_video_messages: bool,
    filter_keywords: &[String],
) -> Option<SkipReason> {
    if let Some(reason) = policy_skip_reason(msg.is_video, skip_video_messages, &msg.text, filter_keywords) {
        return Some(reason);
    }
    if let Some(size) = msg.file_size {
        if size > max_file_size_bytes {
            return Some(SkipReason::FileTooLarge);
        }
    }
    None
}

/// Groups consecutive messages sharing a `grouped_id` into an album batch;
/// ungrouped messages each form a batch of one. Mirrors the batch/album
/// flush policy in C7.
fn group_by_media(messages: &[RawMessage]) -> Vec<Vec<RawMessage>> {
    let mut out: Vec<Vec<RawMessage>> = Vec::new();
    for msg in messages {
        if let Some(gid) = msg.grouped_id {
            if let Some(last) = out.last_mut() {
                if last.first().and_then(|m: &RawMessage| m.grouped_id) == Some(gid) {
                    last.push(msg.clone());
                    continue;
                }
            }
            out.push(vec![msg.clone()]);
        } else {
            out.push(vec![msg.clone()]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i32, grouped_id: Option<i64>) -> RawMessage {
        RawMessage { id, date: 0, text: String::new(), grouped_id, has_media: false, is_video: false, file_size: None, has_spoiler: false, noforwards: false }
    }

    #[test]
    fn groups_consecutive_same_album() {
        let batch = vec![msg(100, Some(1)), msg(101, Some(1)), msg(102, None), msg(103, Some(2)), msg(104, Some(2))];
        let groups = group_by_media(&batch);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2].len(), 2);
    }

    #[test]
    fn oversize_file_is_pre_skipped() {
        let big = RawMessage { file_size: Some(1000), ..msg(1, None) };
        assert_eq!(pre_skip_reason(&big, 500, false, &[]), Some(SkipReason::FileTooLarge));
        assert_eq!(pre_skip_reason(&msg(1, None), 500, false, &[]), None);
    }

    #[test]
    fn disabled_video_is_pre_skipped_before_oversize_check() {
        let video = RawMessage { has_media: true, is_video: true, ..msg(1, None) };
        assert_eq!(pre_skip_reason(&video, i64::MAX, true, &[]), Some(SkipReason::Filtered));
        assert_eq!(pre_skip_reason(&video, i64::MAX, false, &[]), None);
    }
}
