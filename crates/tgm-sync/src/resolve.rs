//! The resolve worker (C6): identifier resolution, auto-mirror-channel
//! creation, discussion-group linking and admin promotion.

use tgm_common::identifiers::{canonicalize_identifier, parse_identifier, ChatRef};
use tgm_common::truncate_with_ellipsis;
use tgm_db::{sources::SourceRepo, Db};
use tgm_tasks::TaskLifecycle;
use tgm_telegram::ChatClient;
use tracing::{info, warn};

use crate::dedupe::SyncDedup;

const MIRROR_TITLE_PREFIX: &str = "Mirror: ";
const MIRROR_TITLE_MAX_CHARS: usize = 120;
const DISCUSSION_SUFFIX: &str = " 评论区";
const DISCUSSION_POLL_ATTEMPTS: u32 = 8;
const DISCUSSION_POLL_DELAY_MS: u64 = 400;

/// Resolves `source_id`'s canonical identifier against the chat service,
/// persists the resolved metadata, and — if the paired mirror is
/// auto-created and unresolved — creates the mirror broadcast channel, its
/// linked discussion group, and promotes the configured admins.
pub async fn run_resolve(
    db: &Db,
    chat: &ChatClient,
    dedup: &SyncDedup,
    task_id: uuid::Uuid,
    source_id: uuid::Uuid,
    admin_identifiers: &[String],
) -> anyhow::Result<()> {
    let sources = SourceRepo::new(&db.pool);
    let lifecycle = TaskLifecycle::new(db.clone());

    let Some(source) = sources.find_by_id(source_id).await? else {
        lifecycle.fail(task_id, "source channel no longer exists").await?;
        return Ok(());
    };

    let Some(chat_ref) = parse_identifier(&source.identifier) else {
        lifecycle.fail(task_id, &format!("unparseable identifier: {}", source.identifier)).await?;
        return Ok(());
    };

    let resolved = match chat.resolve_identifier(&chat_ref).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            lifecycle.fail(task_id, "identifier did not resolve to a channel").await?;
            return Ok(());
        }
        Err(e) => {
            lifecycle.fail(task_id, &e.to_string()).await?;
            return Ok(());
        }
    };

    let full = chat.fetch_full_channel(resolved).await?;
    let about = if full.about.is_empty() { None } else { Some(full.about.as_str()) };
    let username = match &chat_ref {
        ChatRef::Username(u) => Some(u.as_str()),
        _ => None,
    };
    let canonical = canonicalize_identifier(username, Some(resolved.numeric_id)).unwrap_or(source.identifier.clone());

    sources
        .persist_resolution(
            source.id,
            &canonical,
            resolved.numeric_id,
            resolved.access_hash,
            username,
            username,
            about,
            full.participants_count.map(i64::from),
            full.noforwards,
        )
        .await?;

    info!(source_channel_id = %source.id, "resolved source channel");

    if let Err(e) = ensure_auto_mirror(db, chat, dedup, source_id, username.unwrap_or(&canonical), admin_identifiers).await {
        warn!(source_channel_id = %source.id, error = %e, "auto-mirror setup failed, source resolved but mirror incomplete");
    }

    lifecycle.complete(task_id).await?;
    Ok(())
}

async fn ensure_auto_mirror(
    db: &Db,
    chat: &ChatClient,
    dedup: &SyncDedup,
    source_id: uuid::Uuid,
    source_display_name: &str,
    admin_identifiers: &[String],
) -> anyhow::Result<()> {
    let sources = SourceRepo::new(&db.pool);
    let Some(mirror) = sources.mirror_for_source(source_id).await? else {
        return Ok(());
    };
    if !mirror.is_auto_created || mirror.numeric_id.is_some() {
        return Ok(());
    }

    let title = build_mirror_title(source_display_name);
    let broadcast = chat.create_broadcast_channel(&title, "").await?;

    let invite_link = chat.export_invite_link(broadcast).await.ok();

    let discussion_title = format!("{title}{DISCUSSION_SUFFIX}");
    let discussion = match chat.create_and_link_discussion(broadcast, &discussion_title).await {
        Ok(group) => {
            poll_discussion_linked(chat, broadcast).await;
            Some(group)
        }
        Err(e) => {
            warn!(source_channel_id = %source_id, error = %e, "discussion group creation/link failed");
            None
        }
    };

    sources
        .create_auto_mirror(
            source_id,
            broadcast.numeric_id,
            broadcast.access_hash,
            &title,
            invite_link.as_deref(),
            discussion.map(|d| d.numeric_id),
            discussion.map(|d| d.access_hash),
        )
        .await?;

    for identifier in admin_identifiers {
        if !dedup.mark_admin_promotion_attempted(source_id, identifier) {
            continue;
        }
        let username = identifier.trim_start_matches('@');
        match chat.resolve_user(username).await {
            Ok(Some(user)) => {
                if let Err(e) = chat.invite_and_promote_admin(broadcast, user).await {
                    warn!(admin = identifier, error = %e, "failed to promote admin on auto-created mirror");
                } else {
                    info!(admin = identifier, "promoted admin on auto-created mirror");
                }
            }
            Ok(None) => warn!(admin = identifier, "admin identifier did not resolve to a user"),
            Err(e) => warn!(admin = identifier, error = %e, "failed to resolve admin identifier"),
        }
    }

    Ok(())
}

fn build_mirror_title(source_display_name: &str) -> String {
    let candidate = format!("{MIRROR_TITLE_PREFIX}{source_display_name}");
    truncate_with_ellipsis(&candidate, MIRROR_TITLE_MAX_CHARS)
}

/// The discussion link doesn't take effect in channel metadata
/// synchronously; poll up to `DISCUSSION_POLL_ATTEMPTS` times before giving
/// up (best-effort, never surfaced as an error).
async fn poll_discussion_linked(chat: &ChatClient, broadcast: tgm_telegram::ChannelRef) {
    for _ in 0..DISCUSSION_POLL_ATTEMPTS {
        if let Ok(full) = chat.fetch_full_channel(broadcast).await {
            if full.linked_chat_id.is_some() {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(DISCUSSION_POLL_DELAY_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_title_gets_prefix() {
        assert_eq!(build_mirror_title("news"), "Mirror: news");
    }

    #[test]
    fn mirror_title_truncates_long_names() {
        let long = "x".repeat(200);
        let title = build_mirror_title(&long);
        assert_eq!(title.chars().count(), MIRROR_TITLE_MAX_CHARS);
        assert!(title.ends_with('…'));
    }
}
