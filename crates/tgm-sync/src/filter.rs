//! Pre-skip policy shared by the history backfill and realtime workers:
//! the per-channel keyword filter override and the disabled-video switch,
//! both applied before a message is ever attempted against the
//! chat-service adapter.

use tgm_common::{MessageFilterMode, SkipReason, SourceChannel};
use tgm_db::settings::{parse_keywords, MessageFilterSettings};

/// Resolves the keyword list that gates a source's messages: a `custom`
/// override replaces the global list outright, `disabled` turns filtering
/// off regardless of the global setting, and `inherit` (the default) falls
/// through to the global list only if it's enabled.
pub fn effective_keywords(source: &SourceChannel, global: &MessageFilterSettings) -> Vec<String> {
    match source.message_filter_mode {
        MessageFilterMode::Disabled => Vec::new(),
        MessageFilterMode::Custom => source
            .message_filter_keywords
            .as_deref()
            .map(parse_keywords)
            .unwrap_or_default(),
        MessageFilterMode::Inherit => {
            if global.enabled {
                global.keywords.clone()
            } else {
                Vec::new()
            }
        }
    }
}

fn text_matches_keywords(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    keywords.iter().any(|kw| lower.contains(kw.as_str()))
}

/// The disabled-video / keyword-filter half of a message's pre-skip check.
/// Callers still apply the oversize check separately alongside this.
pub fn policy_skip_reason(
    is_video: bool,
    skip_video_messages: bool,
    text: &str,
    keywords: &[String],
) -> Option<SkipReason> {
    if skip_video_messages && is_video {
        return Some(SkipReason::Filtered);
    }
    if text_matches_keywords(text, keywords) {
        return Some(SkipReason::Filtered);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_mode(mode: MessageFilterMode, keywords: Option<&str>) -> SourceChannel {
        SourceChannel {
            id: uuid::Uuid::nil(),
            identifier: "src".to_string(),
            numeric_id: None,
            access_hash: None,
            display_name: None,
            username: None,
            mirror_mode: tgm_common::MirrorMode::Forward,
            sync_status: tgm_common::SyncStatus::Pending,
            is_active: true,
            is_protected: false,
            message_filter_mode: mode,
            message_filter_keywords: keywords.map(str::to_string),
            priority: 0,
            subscribed_at: None,
            last_sync_at: None,
            last_processed_id: None,
            member_count: None,
            description: None,
        }
    }

    #[test]
    fn custom_mode_uses_per_channel_keywords_even_if_global_disabled() {
        let source = source_with_mode(MessageFilterMode::Custom, Some("spam, scam"));
        let global = MessageFilterSettings { enabled: false, keywords: vec!["ignored".to_string()] };
        let keywords = effective_keywords(&source, &global);
        assert_eq!(keywords, vec!["spam".to_string(), "scam".to_string()]);
    }

    #[test]
    fn disabled_mode_ignores_global_filter() {
        let source = source_with_mode(MessageFilterMode::Disabled, None);
        let global = MessageFilterSettings { enabled: true, keywords: vec!["spam".to_string()] };
        assert!(effective_keywords(&source, &global).is_empty());
    }

    #[test]
    fn inherit_mode_falls_through_to_global_when_enabled() {
        let source = source_with_mode(MessageFilterMode::Inherit, None);
        let global = MessageFilterSettings { enabled: true, keywords: vec!["spam".to_string()] };
        assert_eq!(effective_keywords(&source, &global), vec!["spam".to_string()]);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let keywords = vec!["spam".to_string()];
        assert!(text_matches_keywords("This is SPAM content", &keywords));
        assert!(!text_matches_keywords("clean text", &keywords));
    }

    #[test]
    fn disabled_video_setting_skips_regardless_of_text() {
        assert_eq!(policy_skip_reason(true, true, "hello", &[]), Some(SkipReason::Filtered));
        assert_eq!(policy_skip_reason(true, false, "hello", &[]), None);
    }
}
