//! Canonical chat identifier parsing and construction.
//!
//! A source or mirror channel is addressed by a free-form string supplied by
//! an operator: `@username`, a bare `username`, a numeric `-100<id>` form, a
//! `t.me/...` URL, or an invite hash (`+xxx` / `joinchat/xxx`). This module
//! normalizes all of those into the single canonical form the rest of the
//! service persists and compares against.

/// A parsed chat reference, ready to be resolved against the chat-service API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    Username(String),
    NumericId(i64),
    InviteHash(String),
    /// The special literal `me`, referring to the authenticated user.
    SelfUser,
}

/// Parses a free-form identifier string into a `ChatRef`.
pub fn parse_identifier(raw: &str) -> Option<ChatRef> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.eq_ignore_ascii_case("me") {
        return Some(ChatRef::SelfUser);
    }
    if let Some(hash) = extract_invite_hash(s) {
        return Some(ChatRef::InviteHash(hash));
    }
    if let Some(rest) = s.strip_prefix('@') {
        return valid_username(rest).then(|| ChatRef::Username(rest.to_string()));
    }
    if let Some(numeric) = parse_numeric_form(s) {
        return Some(ChatRef::NumericId(numeric));
    }
    if let Some(username) = parse_tme_username(s) {
        return valid_username(&username).then(|| ChatRef::Username(username));
    }
    // Bare username with no leading `@`.
    valid_username(s).then(|| ChatRef::Username(s.to_string()))
}

fn valid_username(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 32
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && s.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
}

/// `-100<id>` is Telegram's bot-API convention for supergroup/channel ids:
/// the canonical form prefixes the positive numeric id with `-100`.
fn parse_numeric_form(s: &str) -> Option<i64> {
    let n: i64 = s.parse().ok()?;
    if n < 0 {
        let stripped = n.to_string();
        let stripped = stripped.strip_prefix("-100")?;
        stripped.parse().ok()
    } else {
        None
    }
}

fn parse_tme_username(s: &str) -> Option<String> {
    let without_scheme = s
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let rest = without_scheme
        .strip_prefix("t.me/")
        .or_else(|| without_scheme.strip_prefix("telegram.me/"))?;
    if rest.starts_with('c') || rest.starts_with('+') {
        return None;
    }
    Some(rest.split(['/', '?']).next().unwrap_or(rest).to_string())
}

fn extract_invite_hash(s: &str) -> Option<String> {
    let candidate = if let Some(rest) = s.strip_prefix('+') {
        rest
    } else {
        let without_scheme = s.trim_start_matches("https://").trim_start_matches("http://");
        let without_domain = without_scheme
            .strip_prefix("t.me/")
            .or_else(|| without_scheme.strip_prefix("telegram.me/"))?;
        if let Some(rest) = without_domain.strip_prefix("joinchat/") {
            rest
        } else if let Some(rest) = without_domain.strip_prefix('+') {
            rest
        } else {
            return None;
        }
    };
    let hash = candidate.split(['/', '?']).next().unwrap_or(candidate);
    is_invite_hash(hash).then(|| hash.to_string())
}

fn is_invite_hash(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Builds the canonical string representation persisted for a resolved chat:
/// `@<username>` when a username is known, else `-100<id>` for channels,
/// `me` for the authenticated self user.
pub fn canonicalize_identifier(username: Option<&str>, numeric_id: Option<i64>) -> Option<String> {
    if let Some(u) = username {
        let trimmed = u.trim_start_matches('@');
        if valid_username(trimmed) {
            return Some(format!("@{trimmed}"));
        }
    }
    numeric_id.map(|id| format!("-100{}", id.unsigned_abs()))
}

/// Builds a source-message deep link per the external-interface contract.
pub fn message_deep_link(username: Option<&str>, numeric_id: Option<i64>, message_id: i64) -> Option<String> {
    if let Some(u) = username {
        let trimmed = u.trim_start_matches('@');
        if valid_username(trimmed) {
            return Some(format!("https://t.me/{trimmed}/{message_id}"));
        }
    }
    numeric_id.map(|id| format!("https://t.me/c/{}/{message_id}", id.unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_at_username() {
        assert_eq!(
            parse_identifier("@my_channel"),
            Some(ChatRef::Username("my_channel".to_string()))
        );
    }

    #[test]
    fn parses_bare_username() {
        assert_eq!(
            parse_identifier("my_channel"),
            Some(ChatRef::Username("my_channel".to_string()))
        );
    }

    #[test]
    fn parses_negative_100_numeric_id() {
        assert_eq!(parse_identifier("-1001234567890"), Some(ChatRef::NumericId(1234567890)));
    }

    #[test]
    fn parses_tme_url() {
        assert_eq!(
            parse_identifier("https://t.me/my_channel"),
            Some(ChatRef::Username("my_channel".to_string()))
        );
    }

    #[test]
    fn parses_invite_plus_form() {
        assert_eq!(
            parse_identifier("+AbCdEf123"),
            Some(ChatRef::InviteHash("AbCdEf123".to_string()))
        );
    }

    #[test]
    fn parses_joinchat_form() {
        assert_eq!(
            parse_identifier("https://t.me/joinchat/AbCdEf123"),
            Some(ChatRef::InviteHash("AbCdEf123".to_string()))
        );
    }

    #[test]
    fn parses_self_literal() {
        assert_eq!(parse_identifier("me"), Some(ChatRef::SelfUser));
    }

    #[test]
    fn canonical_collapses_username_and_at_form() {
        assert_eq!(canonicalize_identifier(Some("NAME"), None), Some("@NAME".to_string()));
        assert_eq!(canonicalize_identifier(Some("@NAME"), None), Some("@NAME".to_string()));
    }

    #[test]
    fn canonical_falls_back_to_numeric_form() {
        assert_eq!(canonicalize_identifier(None, Some(42)), Some("-10042".to_string()));
    }

    #[test]
    fn numeric_id_round_trips_through_deep_link() {
        let link = message_deep_link(None, Some(555), 10).unwrap();
        assert_eq!(link, "https://t.me/c/555/10");
    }
}
