//! Repository for `source_channel` and `mirror_channel`.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tgm_common::{MirrorChannel, MirrorMode, SourceChannel, SyncStatus};

use crate::retry::with_retry;

fn row_to_source(row: &PgRow) -> SourceChannel {
    SourceChannel {
        id: row.get("id"),
        identifier: row.get("identifier"),
        numeric_id: row.get("numeric_id"),
        access_hash: row.get("access_hash"),
        display_name: row.get("display_name"),
        username: row.get("username"),
        mirror_mode: match row.get::<String, _>("mirror_mode").as_str() {
            "copy" => MirrorMode::Copy,
            _ => MirrorMode::Forward,
        },
        sync_status: match row.get::<String, _>("sync_status").as_str() {
            "syncing" => SyncStatus::Syncing,
            "completed" => SyncStatus::Completed,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Pending,
        },
        is_active: row.get("is_active"),
        is_protected: row.get("is_protected"),
        message_filter_mode: row
            .try_get::<String, _>("message_filter_mode")
            .ok()
            .and_then(|s| tgm_common::MessageFilterMode::from_db_str(&s))
            .unwrap_or_default(),
        message_filter_keywords: row.try_get("message_filter_keywords").ok(),
        priority: row.get("priority"),
        subscribed_at: row.try_get("subscribed_at").ok(),
        last_sync_at: row.try_get("last_sync_at").ok(),
        last_processed_id: row.try_get("last_processed_id").ok(),
        member_count: row.try_get("member_count").ok(),
        description: row.try_get("description").ok(),
    }
}

fn row_to_mirror(row: &PgRow) -> MirrorChannel {
    MirrorChannel {
        id: row.get("id"),
        source_channel_id: row.get("source_channel_id"),
        identifier: row.try_get("identifier").ok(),
        numeric_id: row.try_get("numeric_id").ok(),
        access_hash: row.try_get("access_hash").ok(),
        name: row.try_get("name").ok(),
        username: row.try_get("username").ok(),
        is_auto_created: row.get("is_auto_created"),
        invite_link: row.try_get("invite_link").ok(),
        discussion_numeric_id: row.try_get("discussion_numeric_id").ok(),
        discussion_access_hash: row.try_get("discussion_access_hash").ok(),
    }
}

pub struct SourceRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> SourceRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: uuid::Uuid) -> Result<Option<SourceChannel>, sqlx::Error> {
        with_retry("source.find_by_id", || async {
            sqlx::query("SELECT * FROM source_channel WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool)
                .await
        })
        .await
        .map(|opt| opt.as_ref().map(row_to_source))
    }

    /// Finds the active source channel owning `numeric_id`, unless it has a
    /// `history_full` task pending or running — realtime updates for a
    /// source are only applied once its backfill has made way (C9 gating).
    pub async fn realtime_eligible_by_numeric_id(&self, numeric_id: i64) -> Result<Option<SourceChannel>, sqlx::Error> {
        with_retry("source.realtime_eligible_by_numeric_id", || async {
            sqlx::query(
                "SELECT sc.* FROM source_channel sc WHERE sc.numeric_id = $1 AND sc.is_active = true \
                 AND NOT EXISTS ( \
                     SELECT 1 FROM sync_task st WHERE st.source_channel_id = sc.id \
                     AND st.task_type = 'history_full' AND st.status IN ('pending', 'running') \
                 )",
            )
            .bind(numeric_id)
            .fetch_optional(self.pool)
            .await
        })
        .await
        .map(|opt| opt.as_ref().map(row_to_source))
    }

    pub async fn mirror_for_source(&self, source_id: uuid::Uuid) -> Result<Option<MirrorChannel>, sqlx::Error> {
        with_retry("mirror.find_by_source", || async {
            sqlx::query("SELECT * FROM mirror_channel WHERE source_channel_id = $1")
                .bind(source_id)
                .fetch_optional(self.pool)
                .await
        })
        .await
        .map(|opt| opt.as_ref().map(row_to_mirror))
    }

    /// Active, resolved sources, round-robin ordered by last health-check
    /// time, for the C10 channel health-check scheduler.
    pub async fn active_resolved_sources(&self, limit: i64) -> Result<Vec<SourceChannel>, sqlx::Error> {
        let rows = with_retry("source.active_resolved", || async {
            sqlx::query(
                "SELECT * FROM source_channel WHERE is_active = true AND numeric_id IS NOT NULL \
                 ORDER BY last_sync_at ASC NULLS FIRST LIMIT $1",
            )
            .bind(limit)
            .fetch_all(self.pool)
            .await
        })
        .await?;
        Ok(rows.iter().map(row_to_source).collect())
    }

    pub async fn persist_resolution(
        &self,
        id: uuid::Uuid,
        identifier: &str,
        numeric_id: i64,
        access_hash: i64,
        display_name: Option<&str>,
        username: Option<&str>,
        description: Option<&str>,
        member_count: Option<i64>,
        is_protected: bool,
    ) -> Result<(), sqlx::Error> {
        with_retry("source.persist_resolution", || async {
            sqlx::query(
                "UPDATE source_channel SET identifier = $2, numeric_id = $3, access_hash = $4, \
                 display_name = $5, username = $6, description = $7, member_count = $8, \
                 is_protected = $9, sync_status = 'pending' WHERE id = $1",
            )
            .bind(id)
            .bind(identifier)
            .bind(numeric_id)
            .bind(access_hash)
            .bind(display_name)
            .bind(username)
            .bind(description)
            .bind(member_count)
            .bind(is_protected)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn update_health_metadata(
        &self,
        id: uuid::Uuid,
        description: Option<&str>,
        member_count: Option<i64>,
        is_protected: bool,
        display_name: Option<&str>,
        username: Option<&str>,
        access_hash: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        with_retry("source.update_health_metadata", || async {
            sqlx::query(
                "UPDATE source_channel SET description = $2, member_count = $3, is_protected = $4, \
                 display_name = COALESCE($5, display_name), username = COALESCE($6, username), \
                 access_hash = COALESCE($7, access_hash), last_sync_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(description)
            .bind(member_count)
            .bind(is_protected)
            .bind(display_name)
            .bind(username)
            .bind(access_hash)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_sync_status(&self, id: uuid::Uuid, status: SyncStatus) -> Result<(), sqlx::Error> {
        let s = match status {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Error => "error",
        };
        with_retry("source.mark_sync_status", || async {
            sqlx::query("UPDATE source_channel SET sync_status = $2 WHERE id = $1")
                .bind(id)
                .bind(s)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_protected(&self, id: uuid::Uuid) -> Result<(), sqlx::Error> {
        with_retry("source.mark_protected", || async {
            sqlx::query("UPDATE source_channel SET is_protected = true WHERE id = $1 AND is_protected = false")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn create_auto_mirror(
        &self,
        source_id: uuid::Uuid,
        numeric_id: i64,
        access_hash: i64,
        name: &str,
        invite_link: Option<&str>,
        discussion_numeric_id: Option<i64>,
        discussion_access_hash: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        with_retry("mirror.create_auto_mirror", || async {
            sqlx::query(
                "UPDATE mirror_channel SET numeric_id = $2, access_hash = $3, name = $4, \
                 invite_link = $5, discussion_numeric_id = $6, discussion_access_hash = $7 \
                 WHERE source_channel_id = $1",
            )
            .bind(source_id)
            .bind(numeric_id)
            .bind(access_hash)
            .bind(name)
            .bind(invite_link)
            .bind(discussion_numeric_id)
            .bind(discussion_access_hash)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }
}
