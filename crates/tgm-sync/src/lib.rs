//! Resolve (C6), history-backfill (C7), retry (C8) and realtime (C9)
//! workers: everything that turns a claimed `sync_task` into chat-service
//! calls and `message_mapping` rows.

use thiserror::Error;

pub mod album_buffer;
pub mod comment_anchor;
pub mod dedupe;
pub mod filter;
pub mod history;
pub mod realtime;
pub mod resolve;
pub mod retry_worker;

pub use dedupe::SyncDedup;
pub use history::run_history_backfill;
pub use realtime::RealtimeManager;
pub use resolve::run_resolve;
pub use retry_worker::run_retry;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] tgm_db::DbError),
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("chat service error: {0}")]
    Chat(#[from] tgm_telegram::ChatError),
}
