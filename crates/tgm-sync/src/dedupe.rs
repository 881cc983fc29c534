//! Bounded dedupe caches shared across the resolve and mirroring workers.
//!
//! Both admin promotion and comment-anchor posting are idempotent calls
//! the chat-service adapter has no native dedup for, and both can be
//! re-attempted by a retried `resolve` task or a redelivered history batch.
//! A plain growing `HashSet` would leak memory over the life of a
//! long-running process, so each cache is capped and evicts least-recently
//! used entries once full.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

const ADMIN_KEY_CAPACITY: usize = 10_000;
const COMMENT_ANCHOR_KEY_CAPACITY: usize = 10_000;

pub struct SyncDedup {
    admin_promotions: Mutex<LruCache<String, ()>>,
    comment_anchors: Mutex<LruCache<String, ()>>,
}

impl SyncDedup {
    pub fn new() -> Self {
        Self {
            admin_promotions: Mutex::new(LruCache::new(NonZeroUsize::new(ADMIN_KEY_CAPACITY).unwrap())),
            comment_anchors: Mutex::new(LruCache::new(NonZeroUsize::new(COMMENT_ANCHOR_KEY_CAPACITY).unwrap())),
        }
    }

    /// Returns `true` the first time this `(channel_id, admin_identifier)`
    /// pair is seen, `false` on every later retry.
    pub fn mark_admin_promotion_attempted(&self, channel_id: uuid::Uuid, admin_identifier: &str) -> bool {
        let key = format!("{channel_id}:{admin_identifier}");
        let mut cache = self.admin_promotions.lock();
        if cache.contains(&key) {
            false
        } else {
            cache.put(key, ());
            true
        }
    }

    /// Returns `true` the first time a comment anchor is posted for this
    /// `(mirror_channel_id, mirror_message_id)` pair, `false` on a repeat.
    pub fn mark_comment_anchor_posted(&self, mirror_channel_id: uuid::Uuid, mirror_message_id: i32) -> bool {
        let key = format!("{mirror_channel_id}:{mirror_message_id}");
        let mut cache = self.comment_anchors.lock();
        if cache.contains(&key) {
            false
        } else {
            cache.put(key, ());
            true
        }
    }
}

impl Default for SyncDedup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_promotion_dedup_fires_once_per_pair() {
        let dedup = SyncDedup::new();
        let channel = uuid::Uuid::new_v4();
        assert!(dedup.mark_admin_promotion_attempted(channel, "alice"));
        assert!(!dedup.mark_admin_promotion_attempted(channel, "alice"));
        assert!(dedup.mark_admin_promotion_attempted(channel, "bob"));
    }

    #[test]
    fn comment_anchor_dedup_fires_once_per_message() {
        let dedup = SyncDedup::new();
        let channel = uuid::Uuid::new_v4();
        assert!(dedup.mark_comment_anchor_posted(channel, 42));
        assert!(!dedup.mark_comment_anchor_posted(channel, 42));
        assert!(dedup.mark_comment_anchor_posted(channel, 43));
    }
}
