//! Shared domain types for the channel mirroring service.
//!
//! Every other crate in the workspace depends on this one for the row shapes
//! that mirror the external database schema (see the `source_channel`,
//! `mirror_channel`, `sync_task`, `message_mapping`, `message_edit` and
//! `sync_event` tables) and for the handful of pure helpers (identifier
//! canonicalization, keyword parsing, text truncation) that have no business
//! living behind a database connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod identifiers;
pub mod logging;

pub use identifiers::canonicalize_identifier;

/// Errors shared across crate boundaries that don't belong to any one
/// subsystem (DB, chat adapter, task runner each define their own richer
/// enums and convert into `anyhow::Error` at the call sites that aggregate).
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    Forward,
    Copy,
}

impl Default for MirrorMode {
    fn default() -> Self {
        Self::Forward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFilterMode {
    Inherit,
    Disabled,
    Custom,
}

impl Default for MessageFilterMode {
    fn default() -> Self {
        Self::Inherit
    }
}

impl MessageFilterMode {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Disabled => "disabled",
            Self::Custom => "custom",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "inherit" => Self::Inherit,
            "disabled" => Self::Disabled,
            "custom" => Self::Custom,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Resolve,
    HistoryFull,
    RetryFailed,
    Realtime,
}

impl TaskType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::HistoryFull => "history_full",
            Self::RetryFailed => "retry_failed",
            Self::Realtime => "realtime",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "resolve" => Self::Resolve,
            "history_full" => Self::HistoryFull,
            "retry_failed" => Self::RetryFailed,
            "realtime" => Self::Realtime,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Success,
    Skipped,
    Failed,
}

impl MessageStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ProtectedContent,
    MessageDeleted,
    UnsupportedType,
    FileTooLarge,
    Filtered,
    FailedTooManyTimes,
}

impl SkipReason {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::ProtectedContent => "protected_content",
            Self::MessageDeleted => "message_deleted",
            Self::UnsupportedType => "unsupported_type",
            Self::FileTooLarge => "file_too_large",
            Self::Filtered => "filtered",
            Self::FailedTooManyTimes => "failed_too_many_times",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Sticker,
    Animation,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// An operator-registered source channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChannel {
    pub id: uuid::Uuid,
    pub identifier: String,
    pub numeric_id: Option<i64>,
    pub access_hash: Option<i64>,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub mirror_mode: MirrorMode,
    pub sync_status: SyncStatus,
    pub is_active: bool,
    pub is_protected: bool,
    pub message_filter_mode: MessageFilterMode,
    pub message_filter_keywords: Option<String>,
    pub priority: i32,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_processed_id: Option<i64>,
    pub member_count: Option<i64>,
    pub description: Option<String>,
}

/// The mirror channel paired 1:1 with a `SourceChannel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorChannel {
    pub id: uuid::Uuid,
    pub source_channel_id: uuid::Uuid,
    pub identifier: Option<String>,
    pub numeric_id: Option<i64>,
    pub access_hash: Option<i64>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub is_auto_created: bool,
    pub invite_link: Option<String>,
    pub discussion_numeric_id: Option<i64>,
    pub discussion_access_hash: Option<i64>,
}

/// A unit of work claimed and run by this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: uuid::Uuid,
    pub source_channel_id: uuid::Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub last_processed_id: Option<i64>,
    pub last_error: Option<String>,
}

/// The per-message ledger row. Key: `(source_channel_id, source_message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMapping {
    pub id: uuid::Uuid,
    pub source_channel_id: uuid::Uuid,
    pub source_message_id: i64,
    pub mirror_message_id: Option<i64>,
    pub message_type: MessageType,
    pub media_group_id: Option<String>,
    pub status: MessageStatus,
    pub skip_reason: Option<SkipReason>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub has_media: bool,
    pub file_size: Option<i64>,
    pub text: Option<String>,
    pub text_preview: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub mirrored_at: Option<DateTime<Utc>>,
    pub last_edited_at: Option<DateTime<Utc>>,
    pub edit_count: i32,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Append-only history of source-side edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEdit {
    pub mapping_id: uuid::Uuid,
    pub version: i32,
    pub text: Option<String>,
    pub edited_at: DateTime<Utc>,
}

/// Append-only observability log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: uuid::Uuid,
    pub level: EventLevel,
    pub message: String,
    pub source_channel_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
}

/// `{last_heartbeat_at, started_at, pid}`, stored under the
/// `mirror_service_heartbeat` settings key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

/// Truncates `text` to at most `max_chars` characters, appending an ellipsis
/// when truncation occurred. Operates on `char` boundaries so multi-byte UTF-8
/// (e.g. the discussion-group suffix `评论区`) is never split mid-codepoint.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_noop_when_short() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        let out = truncate_with_ellipsis("hello world", 5);
        assert_eq!(out.chars().count(), 5);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn task_status_round_trips_through_db_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Failed,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::from_db_str(s.as_db_str()), Some(s));
        }
    }

    #[test]
    fn terminal_states_are_failed_and_completed() {
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
