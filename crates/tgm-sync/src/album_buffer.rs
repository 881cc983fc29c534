//! Album buffering (part of C9): groups realtime arrivals that share a
//! `grouped_id` into one flush instead of sending each item the moment it
//! arrives.
//!
//! Modelled as state, not sleep: a map of `group_id -> {items, deadline}`
//! with a single sweeper polling for entries whose deadline has passed,
//! rather than one timer task per group. A new arrival for an already
//! buffered group re-arms its deadline, so a flush never fires earlier
//! than `last_arrival + buffer_ms`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tgm_telegram::RawMessage;

/// An item buffered against its already-persisted `message_mapping` row,
/// so a flush can mark success/failure directly without a second lookup.
pub struct BufferedItem {
    pub mapping_id: uuid::Uuid,
    pub message: RawMessage,
}

struct Entry {
    items: Vec<BufferedItem>,
    deadline: Instant,
}

pub struct AlbumBuffer {
    groups: Mutex<HashMap<String, Entry>>,
}

impl Default for AlbumBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AlbumBuffer {
    pub fn new() -> Self {
        Self { groups: Mutex::new(HashMap::new()) }
    }

    /// Adds `item` to the buffer for `group_id`, re-arming the flush
    /// deadline to `buffer_ms` from now.
    pub fn push(&self, group_id: String, item: BufferedItem, buffer_ms: u64) {
        let mut groups = self.groups.lock();
        let entry = groups.entry(group_id).or_insert_with(|| Entry { items: Vec::new(), deadline: Instant::now() });
        entry.items.push(item);
        entry.deadline = Instant::now() + Duration::from_millis(buffer_ms);
    }

    /// Removes and returns every group whose deadline has passed, sorted
    /// ascending by message id within each group. Call on a short fixed
    /// tick (e.g. every 200ms) from the realtime loop.
    pub fn drain_ready(&self) -> Vec<(String, Vec<BufferedItem>)> {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        let ready: Vec<String> = groups.iter().filter(|(_, e)| e.deadline <= now).map(|(k, _)| k.clone()).collect();
        ready
            .into_iter()
            .map(|key| {
                let mut entry = groups.remove(&key).expect("key just observed present");
                entry.items.sort_by_key(|i| i.message.id);
                (key, entry.items)
            })
            .collect()
    }

    /// Number of groups currently buffered, for observability/tests.
    pub fn pending_group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Drains everything regardless of deadline, for graceful shutdown.
    pub fn drain_all(&self) -> Vec<(String, Vec<BufferedItem>)> {
        let mut groups = self.groups.lock();
        groups
            .drain()
            .map(|(key, mut entry)| {
                entry.items.sort_by_key(|i| i.message.id);
                (key, entry.items)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i32) -> BufferedItem {
        let message = RawMessage { id, date: 0, text: String::new(), grouped_id: Some(1), has_media: true, is_video: false, file_size: None, has_spoiler: false, noforwards: false };
        BufferedItem { mapping_id: uuid::Uuid::new_v4(), message }
    }

    #[test]
    fn not_ready_before_deadline() {
        let buf = AlbumBuffer::new();
        buf.push("g1".to_string(), item(1), 10_000);
        assert!(buf.drain_ready().is_empty());
        assert_eq!(buf.pending_group_count(), 1);
    }

    #[test]
    fn ready_after_deadline_elapses() {
        let buf = AlbumBuffer::new();
        buf.push("g1".to_string(), item(2), 1);
        std::thread::sleep(Duration::from_millis(20));
        let ready = buf.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, "g1");
        assert_eq!(buf.pending_group_count(), 0);
    }

    #[test]
    fn new_arrival_reorders_on_flush_by_id() {
        let buf = AlbumBuffer::new();
        buf.push("g1".to_string(), item(5), 1);
        buf.push("g1".to_string(), item(3), 1);
        std::thread::sleep(Duration::from_millis(20));
        let ready = buf.drain_ready();
        let ids: Vec<i32> = ready[0].1.iter().map(|i| i.message.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn drain_all_ignores_deadline() {
        let buf = AlbumBuffer::new();
        buf.push("g1".to_string(), item(1), 60_000);
        assert_eq!(buf.drain_all().len(), 1);
        assert_eq!(buf.pending_group_count(), 0);
    }
}
