//! Environment-variable configuration for the channel mirroring service.
//!
//! Every setting the process needs at startup comes from the environment;
//! there is no config file to parse or search for. Required variables that
//! are missing or malformed fail fast with a descriptive `ConfigError` so
//! the supervisor can exit with the fatal-config code before doing any
//! work.

use std::env;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

fn require(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Missing(name.to_string()))
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: "expected an unsigned integer".to_string(),
    })
}

fn optional_u64_default(name: &str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        Some(v) => parse_u64(name, &v),
        None => Ok(default),
    }
}

fn optional_bool_default(name: &str, default: bool) -> bool {
    match optional(name).as_deref() {
        Some("false") | Some("0") | Some("no") | Some("off") => false,
        Some("true") | Some("1") | Some("yes") | Some("on") => true,
        _ => default,
    }
}

/// Channel health-check cadence knobs (`MIRROR_CHANNEL_HEALTHCHECK*`).
#[derive(Debug, Clone)]
pub struct HealthcheckConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    pub batch_size: u64,
    pub refresh_sec: u64,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            batch_size: 20,
            refresh_sec: 300,
        }
    }
}

/// Process-wide configuration assembled once at startup (C12).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub telegram_api_id: i32,
    pub telegram_api_hash: String,
    pub database_url: String,
    pub encryption_secret: String,

    pub flood_wait_max_sec: u32,
    pub start_retry_interval_sec: u64,
    pub healthcheck: HealthcheckConfig,
    pub sync_comments: bool,
    pub max_comments_per_post: u32,
    pub log_file: Option<String>,
    pub admin_identifiers: Vec<String>,
}

impl EnvConfig {
    /// Reads and validates every setting from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_api_id_raw = require("TELEGRAM_API_ID")?;
        let telegram_api_id: i32 = telegram_api_id_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "TELEGRAM_API_ID".to_string(),
            value: telegram_api_id_raw.clone(),
            reason: "expected a positive integer".to_string(),
        })?;
        if telegram_api_id <= 0 {
            return Err(ConfigError::Invalid {
                name: "TELEGRAM_API_ID".to_string(),
                value: telegram_api_id_raw,
                reason: "must be positive".to_string(),
            });
        }

        let flood_wait_max_sec = optional_u64_default("MIRROR_FLOOD_WAIT_MAX_SEC", 600)?
            .clamp(1, 3600) as u32;

        let healthcheck = HealthcheckConfig {
            enabled: optional_bool_default("MIRROR_CHANNEL_HEALTHCHECK", true),
            interval_sec: optional_u64_default("MIRROR_CHANNEL_HEALTHCHECK_INTERVAL_SEC", 60)?,
            batch_size: optional_u64_default("MIRROR_CHANNEL_HEALTHCHECK_BATCH", 20)?,
            refresh_sec: optional_u64_default("MIRROR_CHANNEL_HEALTHCHECK_REFRESH_SEC", 300)?,
        };

        Ok(Self {
            telegram_api_id,
            telegram_api_hash: require("TELEGRAM_API_HASH")?,
            database_url: require("DATABASE_URL")?,
            encryption_secret: require("ENCRYPTION_SECRET")?,
            flood_wait_max_sec,
            start_retry_interval_sec: optional_u64_default("MIRROR_START_RETRY_INTERVAL_SEC", 10)?,
            healthcheck,
            sync_comments: optional_bool_default("MIRROR_SYNC_COMMENTS", true),
            max_comments_per_post: optional_u64_default("MIRROR_MAX_COMMENTS_PER_POST", 500)? as u32,
            log_file: optional("MIRROR_LOG_FILE"),
            admin_identifiers: optional("MIRROR_ADMIN_IDENTIFIERS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "TELEGRAM_API_ID",
            "TELEGRAM_API_HASH",
            "DATABASE_URL",
            "ENCRYPTION_SECRET",
            "MIRROR_FLOOD_WAIT_MAX_SEC",
            "MIRROR_START_RETRY_INTERVAL_SEC",
            "MIRROR_CHANNEL_HEALTHCHECK",
            "MIRROR_CHANNEL_HEALTHCHECK_INTERVAL_SEC",
            "MIRROR_CHANNEL_HEALTHCHECK_BATCH",
            "MIRROR_CHANNEL_HEALTHCHECK_REFRESH_SEC",
            "MIRROR_SYNC_COMMENTS",
            "MIRROR_MAX_COMMENTS_PER_POST",
            "MIRROR_LOG_FILE",
            "MIRROR_ADMIN_IDENTIFIERS",
        ] {
            env::remove_var(key);
        }
    }

    fn set_required() {
        env::set_var("TELEGRAM_API_ID", "12345");
        env::set_var("TELEGRAM_API_HASH", "abc123");
        env::set_var("DATABASE_URL", "postgres://localhost/mirror");
        env::set_var("ENCRYPTION_SECRET", "super-secret");
    }

    #[test]
    fn missing_required_variable_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = EnvConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(name) if name == "TELEGRAM_API_ID"));
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_required();
        let cfg = EnvConfig::from_env().unwrap();
        assert_eq!(cfg.flood_wait_max_sec, 600);
        assert_eq!(cfg.start_retry_interval_sec, 10);
        assert!(cfg.healthcheck.enabled);
        assert_eq!(cfg.healthcheck.interval_sec, 60);
        assert!(cfg.sync_comments);
        assert_eq!(cfg.max_comments_per_post, 500);
        assert!(cfg.log_file.is_none());
        assert!(cfg.admin_identifiers.is_empty());
        clear_all();
    }

    #[test]
    fn flood_wait_max_is_clamped_to_range() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_required();
        env::set_var("MIRROR_FLOOD_WAIT_MAX_SEC", "99999");
        let cfg = EnvConfig::from_env().unwrap();
        assert_eq!(cfg.flood_wait_max_sec, 3600);
        clear_all();
    }

    #[test]
    fn healthcheck_can_be_disabled() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_required();
        env::set_var("MIRROR_CHANNEL_HEALTHCHECK", "false");
        let cfg = EnvConfig::from_env().unwrap();
        assert!(!cfg.healthcheck.enabled);
        clear_all();
    }
}
