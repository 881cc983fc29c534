//! Task lifecycle, claiming and scheduling (C4, C5, C10).
//!
//! This crate owns every mutation of `sync_task` rows except the ones made
//! directly by the workers in `tgm-sync` as they make progress; those
//! still call back into `lifecycle` for the three terminal-ish
//! transitions (`pause`, `fail`, `complete`).

use thiserror::Error;

pub mod claimer;
pub mod lifecycle;
pub mod schedulers;

pub use claimer::TaskClaimer;
pub use lifecycle::TaskLifecycle;
pub use schedulers::Schedulers;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("database error: {0}")]
    Db(#[from] tgm_db::DbError),
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("chat service error: {0}")]
    Chat(#[from] tgm_telegram::ChatError),
}
