//! Telegram chat-service adapter.
//!
//! Wraps `grammers-client` behind the narrow surface the task workers
//! need: peer resolution, forward-as-copy, text/file/album sends, edits,
//! and the error taxonomy those calls fail into.

pub mod client;
pub mod errors;
pub mod peer;

pub use client::ChatClient;
pub use errors::{classify, is_inaccessible, ChatError};
pub use peer::{ChannelRef, ChatUpdate, RawMessage};
