//! Encrypted Telegram session handling.
//!
//! The service stores exactly one secret outside the process: the Telegram
//! user session, encrypted at rest under the `telegram_session` settings
//! key. This crate owns the codec for that format (AES-256-GCM with a
//! scrypt-derived key) and nothing else — there is no multi-provider
//! abstraction here, because this service has exactly one secret to manage.

use thiserror::Error;

mod encrypted;

pub use encrypted::{decrypt_session, encrypt_session};

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("malformed encrypted session: {0}")]
    Format(String),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption failed (wrong secret or corrupted data)")]
    DecryptionFailed,
}
