//! Postgres access layer for the channel mirroring service.
//!
//! Owns the connection pool, the connection-error retry wrapper, the
//! `LISTEN/NOTIFY` emitter for task-lifecycle notifications, the settings
//! cache, and a thin repository per table. Every other crate talks to the
//! database exclusively through `Db`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;

pub mod events;
pub mod mappings;
pub mod retry;
pub mod settings;
pub mod sources;
pub mod tasks;

pub use settings::SettingsCache;

/// The `LISTEN/NOTIFY` channel used for task-lifecycle notifications.
pub const TASK_NOTIFY_CHANNEL: &str = "tg_back_sync_tasks_v1";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("row not found")]
    NotFound,
    #[error("optimistic claim lost the race")]
    ClaimConflict,
}

/// Notification payload emitted on every task-lifecycle transition.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNotification {
    pub ts: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_channel_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

impl TaskNotification {
    pub fn new() -> Self {
        Self {
            ts: Utc::now(),
            task_id: None,
            source_channel_id: None,
            task_type: None,
            status: None,
        }
    }
}

impl Default for TaskNotification {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the database; cheap to clone (wraps a `PgPool`).
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
    last_notify_warn: Arc<tokio::sync::Mutex<Option<std::time::Instant>>>,
}

impl Db {
    /// Builds a bounded connection pool from `DATABASE_URL`-shaped DSN.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            last_notify_warn: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            last_notify_warn: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Emits a notification on `TASK_NOTIFY_CHANNEL`. Failures are rate-
    /// limited log warnings (once per 10s), never propagated: a dropped
    /// notification only delays a reactive UI refresh, never data
    /// consistency.
    pub async fn notify_task_change(&self, payload: &TaskNotification) {
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize task notification payload");
                return;
            }
        };
        let query = format!("SELECT pg_notify('{TASK_NOTIFY_CHANNEL}', $1)");
        if let Err(e) = sqlx::query(&query).bind(&body).execute(&self.pool).await {
            let mut last = self.last_notify_warn.lock().await;
            let should_log = last.map(|t| t.elapsed() >= Duration::from_secs(10)).unwrap_or(true);
            if should_log {
                warn!(error = %e, "failed to emit task notification");
                *last = Some(std::time::Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_omits_absent_fields() {
        let n = TaskNotification::new();
        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("task_id").is_none());
        assert!(json.get("ts").is_some());
    }
}
