//! Repository for `message_mapping` and `message_edit`.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tgm_common::{truncate_with_ellipsis, MessageMapping, MessageStatus, MessageType, SkipReason};

use crate::retry::with_retry;

const TEXT_PREVIEW_MAX_CHARS: usize = 200;

fn row_to_mapping(row: &PgRow) -> MessageMapping {
    MessageMapping {
        id: row.get("id"),
        source_channel_id: row.get("source_channel_id"),
        source_message_id: row.get("source_message_id"),
        mirror_message_id: row.try_get("mirror_message_id").ok(),
        message_type: match row.get::<String, _>("message_type").as_str() {
            "photo" => MessageType::Photo,
            "video" => MessageType::Video,
            "document" => MessageType::Document,
            "audio" => MessageType::Audio,
            "sticker" => MessageType::Sticker,
            "animation" => MessageType::Animation,
            "other" => MessageType::Other,
            _ => MessageType::Text,
        },
        media_group_id: row.try_get("media_group_id").ok(),
        status: match row.get::<String, _>("status").as_str() {
            "success" => MessageStatus::Success,
            "skipped" => MessageStatus::Skipped,
            "failed" => MessageStatus::Failed,
            _ => MessageStatus::Pending,
        },
        skip_reason: row.try_get::<String, _>("skip_reason").ok().and_then(|s| match s.as_str() {
            "protected_content" => Some(SkipReason::ProtectedContent),
            "message_deleted" => Some(SkipReason::MessageDeleted),
            "unsupported_type" => Some(SkipReason::UnsupportedType),
            "file_too_large" => Some(SkipReason::FileTooLarge),
            "filtered" => Some(SkipReason::Filtered),
            "failed_too_many_times" => Some(SkipReason::FailedTooManyTimes),
            _ => None,
        }),
        error_message: row.try_get("error_message").ok(),
        retry_count: row.get("retry_count"),
        has_media: row.get("has_media"),
        file_size: row.try_get("file_size").ok(),
        text: row.try_get("text").ok(),
        text_preview: row.try_get("text_preview").ok(),
        sent_at: row.try_get("sent_at").ok(),
        mirrored_at: row.try_get("mirrored_at").ok(),
        last_edited_at: row.try_get("last_edited_at").ok(),
        edit_count: row.get("edit_count"),
        is_deleted: row.get("is_deleted"),
        deleted_at: row.try_get("deleted_at").ok(),
    }
}

pub struct MappingRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> MappingRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        source_channel_id: uuid::Uuid,
        source_message_id: i64,
    ) -> Result<Option<MessageMapping>, sqlx::Error> {
        with_retry("mapping.find", || async {
            sqlx::query(
                "SELECT * FROM message_mapping WHERE source_channel_id = $1 AND source_message_id = $2",
            )
            .bind(source_channel_id)
            .bind(source_message_id)
            .fetch_optional(self.pool)
            .await
        })
        .await
        .map(|opt| opt.as_ref().map(row_to_mapping))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_pending(
        &self,
        source_channel_id: uuid::Uuid,
        source_message_id: i64,
        message_type: MessageType,
        media_group_id: Option<&str>,
        has_media: bool,
        file_size: Option<i64>,
        text: Option<&str>,
        sent_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<uuid::Uuid, sqlx::Error> {
        let message_type_str = match message_type {
            MessageType::Text => "text",
            MessageType::Photo => "photo",
            MessageType::Video => "video",
            MessageType::Document => "document",
            MessageType::Audio => "audio",
            MessageType::Sticker => "sticker",
            MessageType::Animation => "animation",
            MessageType::Other => "other",
        };
        let preview = text.map(|t| truncate_with_ellipsis(t, TEXT_PREVIEW_MAX_CHARS));
        let row: (uuid::Uuid,) = with_retry("mapping.upsert_pending", || async {
            sqlx::query_as(
                "INSERT INTO message_mapping \
                 (source_channel_id, source_message_id, message_type, media_group_id, status, \
                  has_media, file_size, text, text_preview, sent_at) \
                 VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9) \
                 ON CONFLICT (source_channel_id, source_message_id) DO UPDATE SET \
                   message_type = EXCLUDED.message_type, media_group_id = EXCLUDED.media_group_id \
                 RETURNING id",
            )
            .bind(source_channel_id)
            .bind(source_message_id)
            .bind(message_type_str)
            .bind(media_group_id)
            .bind(has_media)
            .bind(file_size)
            .bind(text)
            .bind(preview.clone())
            .bind(sent_at)
            .fetch_one(self.pool)
            .await
        })
        .await?;
        Ok(row.0)
    }

    pub async fn mark_success(&self, id: uuid::Uuid, mirror_message_id: i64) -> Result<(), sqlx::Error> {
        with_retry("mapping.mark_success", || async {
            sqlx::query(
                "UPDATE message_mapping SET status = 'success', mirror_message_id = $2, mirrored_at = now() \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(mirror_message_id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_skipped(&self, id: uuid::Uuid, reason: SkipReason) -> Result<(), sqlx::Error> {
        with_retry("mapping.mark_skipped", || async {
            sqlx::query("UPDATE message_mapping SET status = 'skipped', skip_reason = $2 WHERE id = $1")
                .bind(id)
                .bind(reason.as_db_str())
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: uuid::Uuid, error_message: &str) -> Result<(), sqlx::Error> {
        with_retry("mapping.mark_failed", || async {
            sqlx::query(
                "UPDATE message_mapping SET status = 'failed', error_message = $2, retry_count = retry_count + 1 \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error_message)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Failed mappings with `retry_count` below `max_retry_count` and past
    /// the retry task's own `last_processed_id` watermark, for the C8
    /// retry worker. `min_source_message_id` of `None` means no watermark
    /// yet (a fresh retry task scans from the start).
    pub async fn retry_eligible(
        &self,
        source_channel_id: uuid::Uuid,
        max_retry_count: i32,
        min_source_message_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMapping>, sqlx::Error> {
        let rows = with_retry("mapping.retry_eligible", || async {
            sqlx::query(
                "SELECT * FROM message_mapping WHERE source_channel_id = $1 AND status = 'failed' \
                 AND retry_count < $2 AND ($4::bigint IS NULL OR source_message_id > $4) \
                 ORDER BY source_message_id ASC LIMIT $3",
            )
            .bind(source_channel_id)
            .bind(max_retry_count)
            .bind(limit)
            .bind(min_source_message_id)
            .fetch_all(self.pool)
            .await
        })
        .await?;
        Ok(rows.iter().map(row_to_mapping).collect())
    }

    pub async fn mark_failed_too_many_times(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        with_retry("mapping.mark_failed_too_many_times", || async {
            sqlx::query("UPDATE message_mapping SET status = 'skipped', skip_reason = 'failed_too_many_times' WHERE id = $1")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Appends a new row to `message_edit` and bumps the mapping's
    /// `edit_count`/`last_edited_at`. `new_text` is stored verbatim;
    /// callers are responsible for any preview truncation they display.
    pub async fn append_edit(
        &self,
        mapping_id: uuid::Uuid,
        new_text: Option<&str>,
        edited_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<i32, sqlx::Error> {
        let version: (i32,) = with_retry("mapping.append_edit", || async {
            sqlx::query_as(
                "WITH next AS ( \
                     SELECT COALESCE(MAX(version), 0) + 1 AS v FROM message_edit WHERE mapping_id = $1 \
                 ) \
                 INSERT INTO message_edit (mapping_id, version, text, edited_at) \
                 SELECT $1, next.v, $2, $3 FROM next RETURNING version",
            )
            .bind(mapping_id)
            .bind(new_text)
            .bind(edited_at)
            .fetch_one(self.pool)
            .await
        })
        .await?;
        with_retry("mapping.bump_edit_count", || async {
            sqlx::query(
                "UPDATE message_mapping SET edit_count = edit_count + 1, last_edited_at = $2, text = $3 \
                 WHERE id = $1",
            )
            .bind(mapping_id)
            .bind(edited_at)
            .bind(new_text)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(version.0)
    }

    pub async fn mark_deleted(&self, mapping_id: uuid::Uuid, deleted_at: chrono::DateTime<chrono::Utc>) -> Result<(), sqlx::Error> {
        with_retry("mapping.mark_deleted", || async {
            sqlx::query("UPDATE message_mapping SET is_deleted = true, deleted_at = $2 WHERE id = $1")
                .bind(mapping_id)
                .bind(deleted_at)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_preview_cap_matches_helper_contract() {
        let long = "x".repeat(500);
        let preview = truncate_with_ellipsis(&long, TEXT_PREVIEW_MAX_CHARS);
        assert_eq!(preview.chars().count(), TEXT_PREVIEW_MAX_CHARS);
    }
}
