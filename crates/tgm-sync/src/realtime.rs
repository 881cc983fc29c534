//! The realtime worker (C9): one long-lived update loop shared by every
//! active source, rather than a task per group or per source. Telegram's
//! update stream already multiplexes every chat the session is in onto a
//! single connection; this module just routes each update to the source
//! it belongs to and applies C9's new/edit/delete handling.

use std::time::Duration;

use std::sync::Arc;

use tgm_common::{MessageType, MirrorMode, SkipReason};
use tgm_db::{mappings::MappingRepo, settings::SettingsCache, sources::SourceRepo, Db};
use tgm_telegram::{ChannelRef, ChatClient, ChatError, ChatUpdate, RawMessage};
use tracing::warn;

use crate::album_buffer::{AlbumBuffer, BufferedItem};
use crate::comment_anchor::post_comment_anchor;
use crate::dedupe::SyncDedup;
use crate::filter::{effective_keywords, policy_skip_reason};

const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

pub struct RealtimeManager {
    db: Db,
    chat: ChatClient,
    settings: Arc<SettingsCache>,
    dedup: Arc<SyncDedup>,
    album_buffer: AlbumBuffer,
}

impl RealtimeManager {
    pub fn new(db: Db, chat: ChatClient, settings: Arc<SettingsCache>, dedup: Arc<SyncDedup>) -> Self {
        Self { db, chat, settings, dedup, album_buffer: AlbumBuffer::new() }
    }

    /// Runs forever: update consumption and the album sweeper share this
    /// one task via `select!`, so there is exactly one long-lived loop for
    /// the whole process regardless of how many sources are active.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                update = self.chat.next_update() => {
                    match update {
                        Ok(update) => {
                            if let Err(e) = self.handle_update(update).await {
                                warn!(error = %e, "realtime update handling failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "realtime update stream error"),
                    }
                }
                _ = sweep.tick() => {
                    self.flush_ready_albums().await;
                }
            }
        }
    }

    async fn handle_update(&self, update: ChatUpdate) -> anyhow::Result<()> {
        match update {
            ChatUpdate::NewMessage { channel_id, message } => self.handle_new_message(channel_id, message).await,
            ChatUpdate::MessageEdited { channel_id, message } => self.handle_edit(channel_id, message).await,
            ChatUpdate::MessagesDeleted { channel_id, message_ids } => {
                let Some(channel_id) = channel_id else { return Ok(()) };
                self.handle_deletions(channel_id, message_ids).await
            }
            ChatUpdate::Other => Ok(()),
        }
    }

    async fn handle_new_message(&self, channel_id: i64, message: RawMessage) -> anyhow::Result<()> {
        let sources = SourceRepo::new(&self.db.pool);
        let Some(source) = sources.realtime_eligible_by_numeric_id(channel_id).await? else { return Ok(()) };
        let Some(mirror) = sources.mirror_for_source(source.id).await? else { return Ok(()) };
        let (Some(mirror_numeric), Some(mirror_hash)) = (mirror.numeric_id, mirror.access_hash) else { return Ok(()) };
        let mirror_ref = ChannelRef::new(mirror_numeric, mirror_hash);

        let mirror_settings = self.settings.mirror().await;
        let filter_settings = self.settings.message_filter().await;
        let mappings = MappingRepo::new(&self.db.pool);

        let sent_at = chrono::DateTime::from_timestamp(message.date as i64, 0).unwrap_or_else(chrono::Utc::now);
        let mapping_id = mappings
            .upsert_pending(
                source.id,
                message.id as i64,
                classify_message_type(&message),
                message.grouped_id.map(|g| g.to_string()).as_deref(),
                message.has_media,
                message.file_size,
                if message.text.is_empty() { None } else { Some(message.text.as_str()) },
                sent_at,
            )
            .await?;

        let keywords = effective_keywords(&source, &filter_settings);
        if let Some(reason) = policy_skip_reason(message.is_video, mirror_settings.skip_video_messages, &message.text, &keywords) {
            mappings.mark_skipped(mapping_id, reason).await?;
            return Ok(());
        }

        if let Some(size) = message.file_size {
            if size > mirror_settings.max_file_size_bytes {
                mappings.mark_skipped(mapping_id, SkipReason::FileTooLarge).await?;
                return Ok(());
            }
        }

        if let Some(gid) = message.grouped_id {
            if mirror_settings.group_media_messages {
                let key = format!("{}:{gid}", source.id);
                self.album_buffer.push(key, BufferedItem { mapping_id, message }, mirror_settings.media_group_buffer_ms);
                return Ok(());
            }
        }

        self.flush_one(&source, mirror_ref, mapping_id, &message).await
    }

    async fn flush_one(
        &self,
        source: &tgm_common::SourceChannel,
        mirror_ref: ChannelRef,
        mapping_id: uuid::Uuid,
        message: &RawMessage,
    ) -> anyhow::Result<()> {
        let mappings = MappingRepo::new(&self.db.pool);
        let Some(source_ref) = channel_ref_of(source) else { return Ok(()) };

        let outcome: Result<Option<i32>, ChatError> = match source.mirror_mode {
            MirrorMode::Forward => self
                .chat
                .forward_as_copy(source_ref, mirror_ref, &[message.id])
                .await
                .map(|mut r| r.pop().flatten()),
            MirrorMode::Copy => {
                if message.text.is_empty() {
                    mappings.mark_skipped(mapping_id, SkipReason::UnsupportedType).await?;
                    return Ok(());
                }
                self.chat.send_text(mirror_ref, &message.text).await.map(Some)
            }
        };

        match outcome {
            Ok(Some(mirror_message_id)) => {
                mappings.mark_success(mapping_id, mirror_message_id as i64).await?;
                post_comment_anchor(&self.db, &self.chat, &self.dedup, source, mirror_message_id).await;
            }
            Ok(None) => {
                warn!(source_channel_id = %source.id, "realtime send returned no mirror id");
                mappings.mark_failed(mapping_id, "no mirror id in response").await?;
            }
            Err(e) => {
                if e == ChatError::ProtectedContent {
                    SourceRepo::new(&self.db.pool).mark_protected(source.id).await?;
                    mappings.mark_skipped(mapping_id, SkipReason::ProtectedContent).await?;
                } else {
                    mappings.mark_failed(mapping_id, &e.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_edit(&self, channel_id: i64, message: RawMessage) -> anyhow::Result<()> {
        let runtime = self.settings.runtime().await;
        if !runtime.sync_message_edits {
            return Ok(());
        }
        let sources = SourceRepo::new(&self.db.pool);
        let Some(source) = sources.realtime_eligible_by_numeric_id(channel_id).await? else { return Ok(()) };
        let mappings = MappingRepo::new(&self.db.pool);
        let Some(existing) = mappings.find(source.id, message.id as i64).await? else { return Ok(()) };

        let edited_at = chrono::DateTime::from_timestamp(message.date as i64, 0).unwrap_or_else(chrono::Utc::now);
        if let Some(last) = existing.last_edited_at {
            if edited_at <= last {
                return Ok(());
            }
        }

        let new_text = if message.text.is_empty() { None } else { Some(message.text.as_str()) };
        if runtime.keep_edit_history {
            mappings.append_edit(existing.id, new_text, edited_at).await?;
        }

        let Some(mirror_msg_id) = existing.mirror_message_id else { return Ok(()) };
        let Some(mirror) = sources.mirror_for_source(source.id).await? else { return Ok(()) };
        let (Some(numeric), Some(hash)) = (mirror.numeric_id, mirror.access_hash) else { return Ok(()) };
        let mirror_ref = ChannelRef::new(numeric, hash);
        if let Err(e) = self.chat.edit_text(mirror_ref, mirror_msg_id as i32, &message.text).await {
            warn!(source_channel_id = %source.id, error = %e, "failed to propagate edit to mirror");
        }
        Ok(())
    }

    async fn handle_deletions(&self, channel_id: i64, message_ids: Vec<i32>) -> anyhow::Result<()> {
        let runtime = self.settings.runtime().await;
        if !runtime.sync_message_deletions {
            return Ok(());
        }
        let sources = SourceRepo::new(&self.db.pool);
        let Some(source) = sources.realtime_eligible_by_numeric_id(channel_id).await? else { return Ok(()) };
        let mappings = MappingRepo::new(&self.db.pool);
        let deleted_at = chrono::Utc::now();
        for chunk in message_ids.chunks(500) {
            for message_id in chunk {
                if let Some(mapping) = mappings.find(source.id, *message_id as i64).await? {
                    mappings.mark_deleted(mapping.id, deleted_at).await?;
                }
            }
        }
        Ok(())
    }

    async fn flush_ready_albums(&self) {
        for (key, items) in self.album_buffer.drain_ready() {
            if let Err(e) = self.flush_album(&key, items).await {
                warn!(group = %key, error = %e, "album flush failed");
            }
        }
    }

    async fn flush_album(&self, key: &str, items: Vec<BufferedItem>) -> anyhow::Result<()> {
        let Some((source_id_str, _)) = key.split_once(':') else { return Ok(()) };
        let Ok(source_id) = source_id_str.parse::<uuid::Uuid>() else { return Ok(()) };
        let sources = SourceRepo::new(&self.db.pool);
        let Some(source) = sources.find_by_id(source_id).await? else { return Ok(()) };
        let Some(mirror) = sources.mirror_for_source(source_id).await? else { return Ok(()) };
        let (Some(mirror_numeric), Some(mirror_hash)) = (mirror.numeric_id, mirror.access_hash) else { return Ok(()) };
        let mirror_ref = ChannelRef::new(mirror_numeric, mirror_hash);
        let Some(source_ref) = channel_ref_of(&source) else { return Ok(()) };

        let mappings = MappingRepo::new(&self.db.pool);
        match source.mirror_mode {
            MirrorMode::Forward => {
                let ids: Vec<i32> = items.iter().map(|i| i.message.id).collect();
                match self.chat.forward_as_copy(source_ref, mirror_ref, &ids).await {
                    Ok(results) => {
                        let mut first_mirror_id = None;
                        for (item, mirror_id) in items.iter().zip(results.into_iter()) {
                            match mirror_id {
                                Some(id) => {
                                    mappings.mark_success(item.mapping_id, id as i64).await?;
                                    first_mirror_id.get_or_insert(id);
                                }
                                None => mappings.mark_failed(item.mapping_id, "no mirror id in album response").await?,
                            }
                        }
                        if let Some(id) = first_mirror_id {
                            post_comment_anchor(&self.db, &self.chat, &self.dedup, &source, id).await;
                        }
                    }
                    Err(e) => {
                        for item in &items {
                            mappings.mark_failed(item.mapping_id, &e.to_string()).await?;
                        }
                    }
                }
            }
            MirrorMode::Copy => {
                for item in &items {
                    if item.message.text.is_empty() {
                        mappings.mark_skipped(item.mapping_id, SkipReason::UnsupportedType).await?;
                        continue;
                    }
                    match self.chat.send_text(mirror_ref, &item.message.text).await {
                        Ok(id) => mappings.mark_success(item.mapping_id, id as i64).await?,
                        Err(e) => mappings.mark_failed(item.mapping_id, &e.to_string()).await?,
                    }
                }
            }
        }
        Ok(())
    }
}

fn channel_ref_of(source: &tgm_common::SourceChannel) -> Option<ChannelRef> {
    Some(ChannelRef::new(source.numeric_id?, source.access_hash?))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_video_over_generic_media() {
        let msg = RawMessage { id: 1, date: 0, text: String::new(), grouped_id: None, has_media: true, is_video: true, file_size: None, has_spoiler: false, noforwards: false };
        assert_eq!(classify_message_type(&msg), MessageType::Video);
    }

    #[test]
    fn classify_text_when_no_media() {
        let msg = RawMessage { id: 1, date: 0, text: "hi".to_string(), grouped_id: None, has_media: false, is_video: false, file_size: None, has_spoiler: false, noforwards: false };
        assert_eq!(classify_message_type(&msg), MessageType::Text);
    }
}
