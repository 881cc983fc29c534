//! Posts a "jump to original" comment anchor in a mirror's linked
//! discussion group. Shared by the history backfill and realtime workers
//! so both mirror modes get the same anchor behavior after a successful
//! flush, deduped against repeat posts for the same mirror message.

use tgm_common::identifiers::message_deep_link;
use tgm_db::{sources::SourceRepo, Db};
use tgm_telegram::ChannelRef;
use tracing::debug;

use crate::dedupe::SyncDedup;

/// Best-effort: not threaded as a reply, since that needs a reply-capable
/// send this adapter doesn't expose.
pub async fn post_comment_anchor(
    db: &Db,
    chat: &tgm_telegram::ChatClient,
    dedup: &SyncDedup,
    source: &tgm_common::SourceChannel,
    mirror_message_id: i32,
) {
    let sources = SourceRepo::new(&db.pool);
    let Ok(Some(mirror)) = sources.mirror_for_source(source.id).await else { return };
    let (Some(disc_id), Some(disc_hash)) = (mirror.discussion_numeric_id, mirror.discussion_access_hash) else { return };

    if !dedup.mark_comment_anchor_posted(mirror.id, mirror_message_id) {
        return;
    }

    let Some(link) = message_deep_link(source.username.as_deref(), source.numeric_id, mirror_message_id as i64) else { return };
    let discussion_ref = ChannelRef::new(disc_id, disc_hash);
    if let Err(e) = chat.send_text(discussion_ref, &format!("Original: {link}")).await {
        debug!(source_channel_id = %source.id, error = %e, "comment anchor post failed");
    }
}
