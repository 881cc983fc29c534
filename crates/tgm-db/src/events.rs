//! Append-only writer for `sync_event`, the operator-facing activity log.

use sqlx::PgPool;
use tgm_common::{truncate_with_ellipsis, EventLevel};

use crate::retry::with_retry;

/// Events longer than this are truncated before insertion; the log exists
/// for operator triage, not for reproducing full message bodies.
const MAX_EVENT_MESSAGE_CHARS: usize = 2000;

pub struct EventRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> EventRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        level: EventLevel,
        message: &str,
        source_channel_id: Option<uuid::Uuid>,
    ) -> Result<(), sqlx::Error> {
        let truncated = truncate_with_ellipsis(message, MAX_EVENT_MESSAGE_CHARS);
        with_retry("event.record", || async {
            sqlx::query(
                "INSERT INTO sync_event (level, message, source_channel_id) VALUES ($1, $2, $3)",
            )
            .bind(level.as_db_str())
            .bind(&truncated)
            .bind(source_channel_id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn recent_for_source(
        &self,
        source_channel_id: uuid::Uuid,
        limit: i64,
    ) -> Result<Vec<(EventLevel, String, chrono::DateTime<chrono::Utc>)>, sqlx::Error> {
        let rows: Vec<(String, String, chrono::DateTime<chrono::Utc>)> = with_retry("event.recent_for_source", || async {
            sqlx::query_as(
                "SELECT level, message, created_at FROM sync_event \
                 WHERE source_channel_id = $1 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(source_channel_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(level, message, created_at)| {
                let level = match level.as_str() {
                    "warn" => EventLevel::Warn,
                    "error" => EventLevel::Error,
                    _ => EventLevel::Info,
                };
                (level, message, created_at)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_message_over_cap_is_truncated() {
        let long = "a".repeat(3000);
        let truncated = truncate_with_ellipsis(&long, MAX_EVENT_MESSAGE_CHARS);
        assert_eq!(truncated.chars().count(), MAX_EVENT_MESSAGE_CHARS);
        assert!(truncated.ends_with('…'));
    }
}
