//! Process entrypoint (C11 tick loop, C12 bootstrap).
//!
//! Connects the Telegram session, spawns the realtime pipeline as its own
//! task, then runs a single tick loop: claim an eligible `sync_task` and
//! dispatch it to the matching worker, run the C10 ensure-schedulers, sleep,
//! repeat. There is exactly one process, one database pool and one chat
//! connection; scaling out is not a goal this binary serves.

use std::sync::Arc;
use std::time::Duration;

use tgm_common::logging::init_logging;
use tgm_config::EnvConfig;
use tgm_db::settings::SettingsCache;
use tgm_db::{events::EventRepo, tasks::TaskRepo, Db};
use tgm_secrets::decrypt_session;
use tgm_sync::{run_history_backfill, run_resolve, run_retry, RealtimeManager, SyncDedup};
use tgm_tasks::claimer::RunningSources;
use tgm_tasks::{Schedulers, TaskClaimer, TaskLifecycle};
use tgm_telegram::ChatClient;
use tracing::{error, info, warn};

const CLAIM_POLL_IDLE: Duration = Duration::from_millis(1000);
const CLAIM_POLL_BUSY: Duration = Duration::from_millis(200);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = match EnvConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    let _logging_guard = init_logging("tgm-supervisor");

    match run(config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "supervisor exited with a fatal error");
            std::process::exit(1);
        }
    }
}

async fn run(config: EnvConfig) -> anyhow::Result<()> {
    let started_at = chrono::Utc::now();
    let db = Db::connect(&config.database_url, 10).await?;
    let settings = SettingsCache::new(db.pool.clone());

    let chat = connect_with_retry(&db, &settings, &config).await?;
    db_requeue_stuck_tasks(&db).await;

    let running = RunningSources::new();
    let claimer = TaskClaimer::new(db.clone(), running.clone());
    let schedulers = Schedulers::new(
        db.clone(),
        Arc::new(chat.clone()),
        settings.clone(),
        config.healthcheck.interval_sec,
        config.healthcheck.refresh_sec,
    );

    let dedup = Arc::new(SyncDedup::new());

    let realtime = RealtimeManager::new(db.clone(), chat.clone(), settings.clone(), dedup.clone());
    let realtime_handle = tokio::spawn(async move {
        if let Err(e) = realtime.run().await {
            error!(error = %e, "realtime manager exited");
        }
    });

    let mut last_heartbeat = tokio::time::Instant::now() - HEARTBEAT_INTERVAL;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, requeuing running tasks");
                db_requeue_stuck_tasks(&db).await;
                realtime_handle.abort();
                return Ok(());
            }
            claimed = claim_within_cap(&claimer, &running, &settings) => {
                match claimed {
                    Ok(Some(task)) => {
                        spawn_worker(db.clone(), chat.clone(), settings.clone(), dedup.clone(), config.clone(), running.clone(), task);
                        tokio::time::sleep(CLAIM_POLL_BUSY).await;
                    }
                    Ok(None) => tokio::time::sleep(CLAIM_POLL_IDLE).await,
                    Err(e) => {
                        warn!(error = %e, "task claim failed");
                        tokio::time::sleep(CLAIM_POLL_IDLE).await;
                    }
                }
            }
        }

        if let Err(e) = schedulers.tick().await {
            warn!(error = %e, "scheduler tick failed");
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            write_heartbeat(&settings, started_at).await;
            last_heartbeat = tokio::time::Instant::now();
        }
    }
}

/// Connects to Telegram, retrying transient failures every
/// `start_retry_interval_sec` forever. A rejected session or invalid API
/// credentials exit the process immediately instead of retrying.
async fn connect_with_retry(db: &Db, settings: &Arc<SettingsCache>, config: &EnvConfig) -> anyhow::Result<ChatClient> {
    loop {
        let Some(stored) = settings.read_typed::<String>(tgm_db::settings::SESSION_KEY).await? else {
            anyhow::bail!("no telegram session configured under the '{}' settings key", tgm_db::settings::SESSION_KEY);
        };
        let session_bytes = decrypt_session(&stored, &config.encryption_secret)?;

        match ChatClient::connect(config.telegram_api_id, &config.telegram_api_hash, &session_bytes).await {
            Ok(chat) => {
                info!("connected to telegram");
                return Ok(chat);
            }
            Err(tgm_telegram::ChatError::FatalConfig(msg)) => {
                anyhow::bail!("fatal telegram configuration error: {msg}");
            }
            Err(tgm_telegram::ChatError::SessionInvalid) => {
                warn!(retry_in_sec = config.start_retry_interval_sec, "telegram session rejected, will reload and retry");
                let events = EventRepo::new(&db.pool);
                let _ = events
                    .record(tgm_common::EventLevel::Warn, "telegram session rejected, reloading and retrying", None)
                    .await;
                tokio::time::sleep(Duration::from_secs(config.start_retry_interval_sec)).await;
            }
            Err(e) => {
                warn!(error = %e, retry_in_sec = config.start_retry_interval_sec, "telegram connect failed, retrying");
                let events = EventRepo::new(&db.pool);
                let _ = events.record(tgm_common::EventLevel::Warn, &format!("telegram connect failed: {e}"), None).await;
                tokio::time::sleep(Duration::from_secs(config.start_retry_interval_sec)).await;
            }
        }
    }
}

/// Claims the next eligible task only if fewer than `task_runner.concurrency_cap`
/// workers are currently running, so a burst of eligible sources doesn't
/// spawn more concurrent chat-service calls than the operator configured.
async fn claim_within_cap(
    claimer: &TaskClaimer,
    running: &RunningSources,
    settings: &Arc<SettingsCache>,
) -> Result<Option<tgm_common::SyncTask>, tgm_tasks::TaskError> {
    let cap = settings.task_runner().await.concurrency_cap as usize;
    if running.count() >= cap {
        return Ok(None);
    }
    claimer.claim_next().await
}

async fn db_requeue_stuck_tasks(db: &Db) {
    let tasks = TaskRepo::new(&db.pool);
    match tasks.requeue_running().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "requeued running tasks left over from a previous process"),
        Err(e) => warn!(error = %e, "failed to requeue running tasks"),
    }
}

async fn write_heartbeat(settings: &Arc<SettingsCache>, started_at: chrono::DateTime<chrono::Utc>) {
    let payload = serde_json::json!({
        "last_heartbeat_at": chrono::Utc::now(),
        "started_at": started_at,
        "pid": std::process::id(),
    });
    if let Err(e) = settings.write_json(tgm_db::settings::HEARTBEAT_KEY, &payload).await {
        warn!(error = %e, "failed to write heartbeat");
    }
}

fn spawn_worker(
    db: Db,
    chat: ChatClient,
    settings: Arc<SettingsCache>,
    dedup: Arc<SyncDedup>,
    config: EnvConfig,
    running: RunningSources,
    task: tgm_common::SyncTask,
) {
    tokio::spawn(async move {
        let source_id = task.source_channel_id;
        let result = dispatch(&db, &chat, &settings, &dedup, &config, &task).await;
        if let Err(e) = result {
            error!(task_id = %task.id, source_channel_id = %source_id, error = %e, "worker failed");
            let lifecycle = TaskLifecycle::new(db.clone());
            let _ = lifecycle.fail(task.id, &e.to_string()).await;
        }
        running.release(source_id);
    });
}

async fn dispatch(
    db: &Db,
    chat: &ChatClient,
    settings: &Arc<SettingsCache>,
    dedup: &Arc<SyncDedup>,
    config: &EnvConfig,
    task: &tgm_common::SyncTask,
) -> anyhow::Result<()> {
    use tgm_common::TaskType;
    match task.task_type {
        TaskType::Resolve => run_resolve(db, chat, dedup, task.id, task.source_channel_id, &config.admin_identifiers).await,
        TaskType::HistoryFull => {
            let mirror = settings.mirror().await;
            let filter = settings.message_filter().await;
            run_history_backfill(
                db,
                chat,
                dedup,
                task.id,
                task.source_channel_id,
                tgm_sync::history::HistoryBackfillConfig {
                    skip_protected_content: mirror.skip_protected_content,
                    mirror_interval_ms: mirror.mirror_interval_ms,
                    flood_wait_max_sec: config.flood_wait_max_sec,
                    max_file_size_bytes: mirror.max_file_size_bytes,
                    skip_video_messages: mirror.skip_video_messages,
                    filter_enabled: filter.enabled,
                    filter_keywords: filter.keywords,
                },
            )
            .await
        }
        TaskType::RetryFailed => {
            let retry = settings.retry().await;
            let mirror = settings.mirror().await;
            run_retry(
                db,
                chat,
                task.id,
                task.source_channel_id,
                tgm_sync::retry_worker::RetryConfig {
                    max_retry_count: retry.max_retry_count,
                    skip_after_max_retry: retry.skip_after_max_retry,
                    mirror_interval_ms: mirror.mirror_interval_ms,
                    flood_wait_max_sec: config.flood_wait_max_sec,
                },
            )
            .await
        }
        TaskType::Realtime => {
            // Realtime tasks are never created or claimed; the realtime
            // pipeline runs continuously via `RealtimeManager`, outside the
            // claim loop.
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
