//! The retry worker (C8): replays `failed` mappings for a source, grouping
//! adjacent items by media group when the source mirrors in forward mode.

use tgm_common::{MirrorChannel, SkipReason, SourceChannel};
use tgm_db::{mappings::MappingRepo, sources::SourceRepo, tasks::TaskRepo, Db};
use tgm_tasks::TaskLifecycle;
use tgm_telegram::{ChannelRef, ChatClient, ChatError};
use tracing::info;

pub struct RetryConfig {
    pub max_retry_count: u32,
    pub skip_after_max_retry: bool,
    pub mirror_interval_ms: u64,
    pub flood_wait_max_sec: u32,
}

const RETRY_SCAN_LIMIT: i64 = 200;

/// Runs a single `retry_failed` task to completion: every failed mapping
/// for the task's source that is still below `max_retry_count` gets one
/// more attempt, then the task completes (success or not — a mapping that
/// fails again just waits for the next retry task, per C10's retry-task
/// creator cadence).
pub async fn run_retry(
    db: &Db,
    chat: &ChatClient,
    task_id: uuid::Uuid,
    source_id: uuid::Uuid,
    config: RetryConfig,
) -> anyhow::Result<()> {
    let sources = SourceRepo::new(&db.pool);
    let mappings = MappingRepo::new(&db.pool);
    let tasks = TaskRepo::new(&db.pool);
    let lifecycle = TaskLifecycle::new(db.clone());

    let Some(source) = sources.find_by_id(source_id).await? else {
        lifecycle.fail(task_id, "source channel no longer exists").await?;
        return Ok(());
    };
    let Some(mirror) = sources.mirror_for_source(source_id).await? else {
        lifecycle.fail(task_id, "mirror channel missing").await?;
        return Ok(());
    };
    let Some(task) = tasks.find_by_id(task_id).await? else {
        lifecycle.fail(task_id, "retry task no longer exists").await?;
        return Ok(());
    };

    if config.max_retry_count == 0 {
        lifecycle.complete(task_id).await?;
        return Ok(());
    }

    let Some((source_ref, mirror_ref)) = channel_refs(&source, &mirror) else {
        lifecycle.pause(task_id, "source or mirror channel not yet resolved").await?;
        return Ok(());
    };

    let eligible = mappings
        .retry_eligible(source_id, config.max_retry_count as i32, task.last_processed_id, RETRY_SCAN_LIMIT)
        .await?
        .into_iter()
        .filter(|m| m.skip_reason != Some(SkipReason::ProtectedContent))
        .collect::<Vec<_>>();

    let mut retried = 0u32;
    let mut recovered = 0u32;

    'runs: for run in group_runs(&eligible, source.mirror_mode == tgm_common::MirrorMode::Forward) {
        retried += run.len() as u32;

        match source.mirror_mode {
            tgm_common::MirrorMode::Forward => {
                let ids: Vec<i32> = run.iter().map(|m| m.source_message_id as i32).collect();
                match chat.forward_as_copy(source_ref, mirror_ref, &ids).await {
                    Ok(results) => {
                        for (mapping, mirror_id) in run.iter().zip(results.into_iter()) {
                            if let Some(id) = mirror_id {
                                mappings.mark_success(mapping.id, id as i64).await?;
                                recovered += 1;
                            }
                        }
                    }
                    Err(e) => {
                        apply_failure(&mappings, &config, &run, &e).await?;
                        if matches!(e, ChatError::FloodWait(secs) if secs > config.flood_wait_max_sec) {
                            break 'runs;
                        }
                    }
                }
            }
            tgm_common::MirrorMode::Copy => {
                for mapping in &run {
                    let Some(text) = mapping.text.as_deref().filter(|t| !t.is_empty()) else {
                        mappings.mark_skipped(mapping.id, SkipReason::UnsupportedType).await?;
                        continue;
                    };
                    match chat.send_text(mirror_ref, text).await {
                        Ok(id) => {
                            mappings.mark_success(mapping.id, id as i64).await?;
                            recovered += 1;
                        }
                        Err(e) => {
                            let is_unaffordable_flood_wait =
                                matches!(e, ChatError::FloodWait(secs) if secs > config.flood_wait_max_sec);
                            apply_failure(&mappings, &config, std::slice::from_ref(mapping), &e).await?;
                            if is_unaffordable_flood_wait {
                                break 'runs;
                            }
                        }
                    }
                }
            }
        }

        if let Some(max_id) = run.iter().map(|m| m.source_message_id).max() {
            tasks.update_progress(task_id, retried as i64, Some(eligible.len() as i64), Some(max_id)).await?;
        }

        if config.mirror_interval_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(config.mirror_interval_ms)).await;
        }
    }

    info!(task_id = %task_id, retried, recovered, "retry task finished");
    lifecycle.complete(task_id).await?;
    Ok(())
}

async fn apply_failure(
    mappings: &MappingRepo<'_>,
    config: &RetryConfig,
    run: &[tgm_common::MessageMapping],
    error: &ChatError,
) -> anyhow::Result<()> {
    for mapping in run {
        mappings.mark_failed(mapping.id, &error.to_string()).await?;
        if config.skip_after_max_retry && mapping.retry_count as u32 + 1 >= config.max_retry_count {
            mappings.mark_failed_too_many_times(mapping.id).await?;
        }
    }
    Ok(())
}

fn channel_refs(source: &SourceChannel, mirror: &MirrorChannel) -> Option<(ChannelRef, ChannelRef)> {
    let src = ChannelRef::new(source.numeric_id?, source.access_hash?);
    let mir = ChannelRef::new(mirror.numeric_id?, mirror.access_hash?);
    Some((src, mir))
}

/// Groups adjacent eligible mappings that share a non-null `media_group_id`
/// into one run; everything else is its own run of one. Forward mode only
/// — copy mode always retries message-by-message.
fn group_runs(mappings: &[tgm_common::MessageMapping], group_media: bool) -> Vec<Vec<tgm_common::MessageMapping>> {
    if !group_media {
        return mappings.iter().cloned().map(|m| vec![m]).collect();
    }
    let mut out: Vec<Vec<tgm_common::MessageMapping>> = Vec::new();
    for mapping in mappings {
        if let Some(gid) = &mapping.media_group_id {
            if let Some(last) = out.last_mut() {
                if last.first().and_then(|m: &tgm_common::MessageMapping| m.media_group_id.as_deref()) == Some(gid.as_str()) {
                    last.push(mapping.clone());
                    continue;
                }
            }
        }
        out.push(vec![mapping.clone()]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: i64, group: Option<&str>) -> tgm_common::MessageMapping {
        tgm_common::MessageMapping {
            id: uuid::Uuid::new_v4(),
            source_channel_id: uuid::Uuid::new_v4(),
            source_message_id: id,
            mirror_message_id: None,
            message_type: tgm_common::MessageType::Text,
            media_group_id: group.map(String::from),
            status: tgm_common::MessageStatus::Failed,
            skip_reason: None,
            error_message: None,
            retry_count: 0,
            has_media: group.is_some(),
            file_size: None,
            text: Some("hi".to_string()),
            text_preview: None,
            sent_at: Some(chrono::Utc::now()),
            mirrored_at: None,
            last_edited_at: None,
            edit_count: 0,
            is_deleted: false,
            deleted_at: None,
        }
    }

    #[test]
    fn groups_adjacent_album_members_when_forward_mode() {
        let items = vec![mapping(1, Some("g1")), mapping(2, Some("g1")), mapping(3, None)];
        let runs = group_runs(&items, true);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
    }

    #[test]
    fn copy_mode_never_groups() {
        let items = vec![mapping(1, Some("g1")), mapping(2, Some("g1"))];
        let runs = group_runs(&items, false);
        assert_eq!(runs.len(), 2);
    }
}
