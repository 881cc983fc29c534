//! Typed, TTL-cached reads of operator-tunable knobs from the `settings`
//! table (C1).
//!
//! Every getter is backed by a 5-second TTL cache with last-good fallback:
//! if the underlying DB read fails, the previous value (or a compile-time
//! default, if nothing has ever been read successfully) is returned, and
//! the failure is logged at most once per minute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::warn;

const TTL: Duration = Duration::from_secs(5);
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub const HEARTBEAT_KEY: &str = "mirror_service_heartbeat";
pub const SESSION_KEY: &str = "telegram_session";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub sync_message_edits: bool,
    pub keep_edit_history: bool,
    pub sync_message_deletions: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            sync_message_edits: true,
            keep_edit_history: true,
            sync_message_deletions: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub mirror_interval_ms: u64,
    pub max_file_size_bytes: i64,
    pub group_media_messages: bool,
    pub skip_protected_content: bool,
    pub media_group_buffer_ms: u64,
    pub skip_video_messages: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            mirror_interval_ms: 500,
            max_file_size_bytes: 2 * 1024 * 1024 * 1024,
            group_media_messages: true,
            skip_protected_content: true,
            media_group_buffer_ms: 2000,
            skip_video_messages: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilterSettings {
    pub enabled: bool,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRunnerSettings {
    pub concurrency_cap: u32,
}

impl Default for TaskRunnerSettings {
    fn default() -> Self {
        Self { concurrency_cap: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retry_count: u32,
    pub retry_interval_sec: u32,
    pub skip_after_max_retry: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_count: 5,
            retry_interval_sec: 300,
            skip_after_max_retry: true,
        }
    }
}

struct CachedValue<T> {
    value: T,
    fetched_at: Instant,
}

struct Slot<T> {
    cached: RwLock<Option<CachedValue<T>>>,
    last_error_log: RwLock<Option<Instant>>,
}

impl<T: Clone + Default> Slot<T> {
    fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            last_error_log: RwLock::new(None),
        }
    }
}

/// TTL-cached settings reader. One instance is shared across the process.
pub struct SettingsCache {
    pool: PgPool,
    runtime: Slot<RuntimeSettings>,
    mirror: Slot<MirrorSettings>,
    filter: Slot<MessageFilterSettings>,
    task_runner: Slot<TaskRunnerSettings>,
    retry: Slot<RetrySettings>,
}

impl SettingsCache {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            runtime: Slot::new(),
            mirror: Slot::new(),
            filter: Slot::new(),
            task_runner: Slot::new(),
            retry: Slot::new(),
        })
    }

    pub async fn runtime(&self) -> RuntimeSettings {
        self.get_cached(&self.runtime, "runtime", |row| RuntimeSettings {
            sync_message_edits: row.get("sync_message_edits").and_then(Value::as_bool).unwrap_or(true),
            keep_edit_history: row.get("keep_edit_history").and_then(Value::as_bool).unwrap_or(true),
            sync_message_deletions: row.get("sync_message_deletions").and_then(Value::as_bool).unwrap_or(true),
        })
        .await
    }

    pub async fn mirror(&self) -> MirrorSettings {
        self.get_cached(&self.mirror, "mirror", |row| MirrorSettings {
            mirror_interval_ms: row.get("mirror_interval_ms").and_then(Value::as_u64).unwrap_or(500),
            max_file_size_bytes: row
                .get("max_file_size_bytes")
                .and_then(Value::as_i64)
                .unwrap_or(2 * 1024 * 1024 * 1024),
            group_media_messages: row.get("group_media_messages").and_then(Value::as_bool).unwrap_or(true),
            skip_protected_content: row.get("skip_protected_content").and_then(Value::as_bool).unwrap_or(true),
            media_group_buffer_ms: row
                .get("media_group_buffer_ms")
                .and_then(Value::as_u64)
                .unwrap_or(2000)
                .clamp(200, 10_000),
            skip_video_messages: row.get("skip_video_messages").and_then(Value::as_bool).unwrap_or(false),
        })
        .await
    }

    pub async fn message_filter(&self) -> MessageFilterSettings {
        self.get_cached(&self.filter, "message_filter", |row| MessageFilterSettings {
            enabled: row.get("enabled").and_then(Value::as_bool).unwrap_or(false),
            keywords: row
                .get("keywords")
                .and_then(Value::as_str)
                .map(parse_keywords)
                .unwrap_or_default(),
        })
        .await
    }

    pub async fn task_runner(&self) -> TaskRunnerSettings {
        self.get_cached(&self.task_runner, "task_runner", |row| TaskRunnerSettings {
            concurrency_cap: (row.get("concurrency_cap").and_then(Value::as_u64).unwrap_or(3) as u32).clamp(1, 10),
        })
        .await
    }

    pub async fn retry(&self) -> RetrySettings {
        self.get_cached(&self.retry, "retry", |row| RetrySettings {
            max_retry_count: (row.get("max_retry_count").and_then(Value::as_u64).unwrap_or(5) as u32).clamp(0, 100),
            retry_interval_sec: (row.get("retry_interval_sec").and_then(Value::as_u64).unwrap_or(300) as u32)
                .clamp(0, 86_400),
            skip_after_max_retry: row.get("skip_after_max_retry").and_then(Value::as_bool).unwrap_or(true),
        })
        .await
    }

    async fn get_cached<T, F>(&self, slot: &Slot<T>, key: &str, parse: F) -> T
    where
        T: Clone + Default,
        F: Fn(&serde_json::Map<String, Value>) -> T,
    {
        {
            let cached = slot.cached.read().await;
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < TTL {
                    return c.value.clone();
                }
            }
        }
        match self.fetch_json(key).await {
            Ok(Some(json)) => {
                let map = json.as_object().cloned().unwrap_or_default();
                let value = parse(&map);
                let mut cached = slot.cached.write().await;
                *cached = Some(CachedValue { value: value.clone(), fetched_at: Instant::now() });
                value
            }
            Ok(None) => {
                let value = T::default();
                let mut cached = slot.cached.write().await;
                *cached = Some(CachedValue { value: value.clone(), fetched_at: Instant::now() });
                value
            }
            Err(e) => {
                self.log_error_rate_limited(slot, key, &e).await;
                let cached = slot.cached.read().await;
                cached.as_ref().map(|c| c.value.clone()).unwrap_or_default()
            }
        }
    }

    async fn log_error_rate_limited<T>(&self, slot: &Slot<T>, key: &str, err: &sqlx::Error)
    where
        T: Clone + Default,
    {
        let mut last = slot.last_error_log.write().await;
        let should_log = last.map(|t| t.elapsed() >= ERROR_LOG_INTERVAL).unwrap_or(true);
        if should_log {
            warn!(setting = key, error = %err, "settings read failed, using last-good/default value");
            *last = Some(Instant::now());
        }
    }

    async fn fetch_json(&self, key: &str) -> Result<Option<Value>, sqlx::Error> {
        let row: Option<(Value,)> = crate::retry::with_retry("settings.fetch", || async {
            sqlx::query_as("SELECT value FROM settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn read_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, sqlx::Error> {
        let json = self.fetch_json(key).await?;
        Ok(json.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn write_json(&self, key: &str, value: &Value) -> Result<(), sqlx::Error> {
        crate::retry::with_retry("settings.write", || async {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }
}

/// Splits on whitespace, comma, full-width comma (`，`), semicolon, or
/// newline; lowercases, dedupes (order-preserving), truncates each keyword
/// to 100 chars and the overall list to 200 entries.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for piece in raw.split(|c: char| c.is_whitespace() || c == ',' || c == '，' || c == ';' || c == '\n') {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut lowered = trimmed.to_lowercase();
        if lowered.chars().count() > 100 {
            lowered = lowered.chars().take(100).collect();
        }
        if seen.insert(lowered.clone()) {
            out.push(lowered);
            if out.len() >= 200 {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_parser_dedupes_and_lowercases() {
        let out = parse_keywords("Foo, foo bar;baz\nFOO");
        assert_eq!(out, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn keyword_parser_respects_full_width_comma() {
        let out = parse_keywords("one，two");
        assert_eq!(out, vec!["one", "two"]);
    }

    #[test]
    fn keyword_parser_caps_list_at_200() {
        let many = (0..1000).map(|i| format!("kw{i}")).collect::<Vec<_>>().join(",");
        let out = parse_keywords(&many);
        assert_eq!(out.len(), 200);
    }

    #[test]
    fn keyword_parser_truncates_long_keywords() {
        let long = "a".repeat(150);
        let out = parse_keywords(&long);
        assert_eq!(out[0].chars().count(), 100);
    }
}
