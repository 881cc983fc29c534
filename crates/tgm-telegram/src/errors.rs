//! Error classification for the chat-service adapter (C3).
//!
//! `grammers-client` surfaces MTProto RPC failures as loosely-typed
//! `InvocationError`s keyed by an error-code string plus an optional
//! numeric value (e.g. `FLOOD_WAIT` carries the wait in seconds). This
//! module maps every RPC failure this service needs to react to onto the
//! taxonomy the task workers branch on.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("flood wait: retry after {0}s")]
    FloodWait(u32),
    #[error("protected content")]
    ProtectedContent,
    #[error("message deleted")]
    MessageDeleted,
    #[error("session invalid")]
    SessionInvalid,
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("other chat error: {0}")]
    Other(String),
}

const FATAL_CONFIG_CODES: &[&str] = &["API_ID_INVALID", "API_ID_PUBLISHED_FLOOD", "APP_VERSION_INVALID"];

const SESSION_INVALID_CODES: &[&str] = &["AUTH_KEY_UNREGISTERED", "AUTH_KEY_INVALID", "SESSION_REVOKED", "USER_DEACTIVATED"];

const PROTECTED_CONTENT_CODES: &[&str] = &["CHAT_FORWARDS_RESTRICTED"];

const MESSAGE_DELETED_CODES: &[&str] = &["MESSAGE_ID_INVALID", "MESSAGE_DELETE_FORBIDDEN"];

/// Channel-inaccessible error codes recognized by the C10 health-check
/// scheduler; exposed here because they share the same RPC-error surface.
pub const INACCESSIBLE_CODES: &[&str] = &[
    "CHANNEL_PRIVATE",
    "CHANNEL_INVALID",
    "USERNAME_NOT_OCCUPIED",
    "PEER_ID_INVALID",
    "AUTH_KEY_UNREGISTERED",
];

const TRANSIENT_SUBSTRINGS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection closed",
    "socket",
    "network",
    "rpc_call_fail",
    "rpc_mcget_fail",
];

/// Classifies a raw RPC error code/message pair into the adapter's error
/// taxonomy. `code` is the MTProto error string (e.g. `FLOOD_WAIT_30`,
/// `CHANNEL_PRIVATE`); `message` is the full human-readable error text as
/// surfaced by the client, used only for the FLOOD_WAIT natural-language
/// fallback and the transient-substring scan.
pub fn classify(code: &str, message: &str) -> ChatError {
    if let Some(secs) = parse_flood_wait(code, message) {
        return ChatError::FloodWait(secs);
    }
    if FATAL_CONFIG_CODES.contains(&code) {
        return ChatError::FatalConfig(code.to_string());
    }
    if SESSION_INVALID_CODES.contains(&code) {
        return ChatError::SessionInvalid;
    }
    if PROTECTED_CONTENT_CODES.contains(&code) {
        return ChatError::ProtectedContent;
    }
    if MESSAGE_DELETED_CODES.contains(&code) {
        return ChatError::MessageDeleted;
    }
    let lower = message.to_lowercase();
    if TRANSIENT_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return ChatError::Transient(message.to_string());
    }
    ChatError::Other(format!("{code}: {message}"))
}

/// Parses FLOOD_WAIT seconds from either the machine form (`FLOOD_WAIT_30`)
/// or the English sentence form (`A wait of 30 seconds is required`).
fn parse_flood_wait(code: &str, message: &str) -> Option<u32> {
    if let Some(rest) = code.strip_prefix("FLOOD_WAIT_") {
        if let Ok(secs) = rest.parse::<u32>() {
            return Some(secs);
        }
    }
    let lower = message.to_lowercase();
    if let Some(idx) = lower.find("wait of ") {
        let tail = &lower[idx + "wait of ".len()..];
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
    }
    None
}

/// Returns true when `code` indicates the channel/peer is no longer
/// reachable (used by the C10 health-check scheduler to mark a source
/// `sync_status=error`).
pub fn is_inaccessible(code: &str) -> bool {
    INACCESSIBLE_CODES.contains(&code)
}

impl ChatError {
    /// The raw MTProto error code, when this variant carries one. Used by
    /// callers that need to check it against a code list (e.g.
    /// `is_inaccessible`) rather than matching on the classified variant.
    pub fn code(&self) -> Option<&str> {
        match self {
            ChatError::FatalConfig(code) => Some(code),
            ChatError::SessionInvalid => None,
            ChatError::Other(msg) => msg.split(':').next(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machine_flood_wait() {
        assert_eq!(classify("FLOOD_WAIT_30", "FLOOD_WAIT_30"), ChatError::FloodWait(30));
    }

    #[test]
    fn parses_natural_language_flood_wait() {
        let err = classify("400", "A wait of 120 seconds is required (caused by GetHistoryRequest)");
        assert_eq!(err, ChatError::FloodWait(120));
    }

    #[test]
    fn classifies_fatal_config_codes() {
        assert_eq!(
            classify("API_ID_INVALID", "API_ID_INVALID"),
            ChatError::FatalConfig("API_ID_INVALID".to_string())
        );
    }

    #[test]
    fn classifies_session_invalid() {
        assert_eq!(classify("AUTH_KEY_UNREGISTERED", "AUTH_KEY_UNREGISTERED"), ChatError::SessionInvalid);
    }

    #[test]
    fn classifies_protected_content() {
        assert_eq!(classify("CHAT_FORWARDS_RESTRICTED", "CHAT_FORWARDS_RESTRICTED"), ChatError::ProtectedContent);
    }

    #[test]
    fn classifies_transient_by_message_substring() {
        assert_eq!(
            classify("-500", "rpc call fail due to connection reset"),
            ChatError::Transient("rpc call fail due to connection reset".to_string())
        );
    }

    #[test]
    fn unrecognized_code_falls_back_to_other() {
        matches!(classify("SOME_WEIRD_CODE", "unexpected"), ChatError::Other(_));
    }

    #[test]
    fn inaccessible_codes_recognized() {
        assert!(is_inaccessible("CHANNEL_PRIVATE"));
        assert!(!is_inaccessible("FLOOD_WAIT_5"));
    }
}
