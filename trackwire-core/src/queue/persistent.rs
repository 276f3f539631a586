//! Durable, size- and age-bounded FIFO of pending events

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{DiskStore, TypedStore};
use crate::types::{BatchTrackRequest, Payload};

/// Storage key holding the serialized queue
pub const QUEUE_KEY: &str = "dispatch_queue";

/// One enqueued batch as it is stored on disk.
///
/// Completions are not persisted, so a reloaded entry carries payloads only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub inserted_at: DateTime<Utc>,
    pub events: Vec<Payload>,
}

/// Durable buffer for events awaiting dispatch.
///
/// Nothing is cached in memory: every call reads the store, so counts never
/// drift from what is persisted. Storage failures read as an empty queue and
/// writes are best-effort.
pub struct PersistentQueue {
    store: TypedStore<Vec<QueueEntry>>,
    max_queue_size: usize,
    expiration: Option<Duration>,
}

impl PersistentQueue {
    pub fn new(store: Arc<dyn DiskStore>, max_queue_size: usize) -> Self {
        Self {
            store: TypedStore::new(store, QUEUE_KEY),
            max_queue_size,
            expiration: None,
        }
    }

    /// Purge entries older than `expiration` on every append and release
    pub fn with_expiration(mut self, expiration: Option<std::time::Duration>) -> Self {
        self.expiration = expiration.and_then(|d| Duration::from_std(d).ok());
        self
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Stored entries, oldest first
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.store.retrieve().unwrap_or_default()
    }

    /// Number of events currently stored
    pub fn current_events(&self) -> usize {
        self.entries().iter().map(|e| e.events.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.current_events() == 0
    }

    pub fn enqueue(&mut self, events: Vec<Payload>) {
        self.enqueue_at(events, Utc::now());
    }

    /// Append `events` as one entry, keeping their order.
    ///
    /// When the total exceeds `max_queue_size` the oldest events are dropped,
    /// one event at a time, so an old entry may be cut partway.
    pub fn enqueue_at(&mut self, events: Vec<Payload>, now: DateTime<Utc>) {
        if events.is_empty() {
            return;
        }

        let mut entries = self.entries();
        if let Some(max_age) = self.expiration {
            purge(&mut entries, max_age, now);
        }

        entries.push(QueueEntry {
            inserted_at: now,
            events,
        });

        let dropped = trim_to(&mut entries, self.max_queue_size);
        if dropped > 0 {
            tracing::warn!(
                dropped,
                max_queue_size = self.max_queue_size,
                "Dispatch queue full, dropped oldest events"
            );
        }

        self.persist(entries);
    }

    /// Remove entries inserted before `since - max_age` (`since` defaults to now).
    ///
    /// Returns the number of events removed.
    pub fn remove_old_dispatches(
        &mut self,
        max_age: Duration,
        since: Option<DateTime<Utc>>,
    ) -> usize {
        let mut entries = self.entries();
        let removed = purge(&mut entries, max_age, since.unwrap_or_else(Utc::now));
        if removed > 0 {
            tracing::debug!(removed, "Purged expired queued events");
            self.persist(entries);
        }
        removed
    }

    /// Drain the whole queue as one batch, oldest first
    pub fn release(&mut self) -> Option<BatchTrackRequest> {
        self.release_at(Utc::now())
    }

    pub fn release_at(&mut self, now: DateTime<Utc>) -> Option<BatchTrackRequest> {
        let mut entries = self.entries();
        if let Some(max_age) = self.expiration {
            purge(&mut entries, max_age, now);
        }
        self.store.delete();

        let events: Vec<Payload> = entries.into_iter().flat_map(|e| e.events).collect();
        if events.is_empty() {
            return None;
        }

        tracing::debug!(events = events.len(), "Released dispatch queue");
        Some(BatchTrackRequest::from_payloads(events))
    }

    /// Discard every queued event without dispatching it
    pub fn clear(&mut self) {
        self.store.delete();
    }

    fn persist(&self, entries: Vec<QueueEntry>) {
        if entries.is_empty() {
            self.store.delete();
        } else {
            self.store.save(&entries);
        }
    }
}

fn purge(entries: &mut Vec<QueueEntry>, max_age: Duration, since: DateTime<Utc>) -> usize {
    let cutoff = since - max_age;
    let mut removed = 0;
    entries.retain(|entry| {
        let keep = entry.inserted_at >= cutoff;
        if !keep {
            removed += entry.events.len();
        }
        keep
    });
    removed
}

/// Drop the oldest events until at most `max` remain; returns the number dropped
fn trim_to(entries: &mut Vec<QueueEntry>, max: usize) -> usize {
    let total: usize = entries.iter().map(|e| e.events.len()).sum();
    let mut excess = total.saturating_sub(max);
    let dropped = excess;

    while excess > 0 && !entries.is_empty() {
        let oldest = entries[0].events.len();
        if oldest <= excess {
            entries.remove(0);
            excess -= oldest;
        } else {
            entries[0].events.drain(..excess);
            excess = 0;
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::keys;
    use serde_json::{json, Value};

    fn event(name: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert(keys::EVENT.to_string(), Value::String(name.to_string()));
        payload
    }

    fn events(names: &[&str]) -> Vec<Payload> {
        names.iter().map(|n| event(n)).collect()
    }

    fn names(batch: &BatchTrackRequest) -> Vec<String> {
        batch
            .payloads()
            .iter()
            .map(|p| p[keys::EVENT].as_str().unwrap().to_string())
            .collect()
    }

    fn queue(max: usize) -> (Arc<MemoryStore>, PersistentQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = PersistentQueue::new(store.clone() as Arc<dyn DiskStore>, max);
        (store, queue)
    }

    #[test]
    fn test_size_cap_keeps_most_recent_events_in_order() {
        let (_, mut queue) = queue(5);
        let mut inserted = Vec::new();

        for round in 0..6 {
            let batch: Vec<String> = (0..round % 3 + 1)
                .map(|i| format!("e{}-{}", round, i))
                .collect();
            inserted.extend(batch.clone());
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            queue.enqueue(events(&refs));
            assert!(queue.current_events() <= 5);
        }

        let released = queue.release().unwrap();
        let expected: Vec<String> = inserted[inserted.len() - 5..].to_vec();
        assert_eq!(names(&released), expected);
    }

    #[test]
    fn test_trim_cuts_partial_entry() {
        let (_, mut queue) = queue(3);
        queue.enqueue(events(&["a", "b", "c"]));
        queue.enqueue(events(&["d"]));

        let entries = queue.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].events.len(), 2);
        assert_eq!(names(&queue.release().unwrap()), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_release_drains_in_insertion_order() {
        let (store, mut queue) = queue(100);
        queue.enqueue(events(&["first", "second"]));
        queue.enqueue(events(&["third"]));

        let released = queue.release().unwrap();
        assert_eq!(names(&released), vec!["first", "second", "third"]);
        assert!(!released.requests.iter().any(|r| r.has_completion()));
        assert_eq!(queue.current_events(), 0);
        assert!(store.keys().is_empty());
        assert!(queue.release().is_none());
    }

    #[test]
    fn test_remove_old_dispatches_uses_strict_cutoff() {
        let (_, mut queue) = queue(100);
        let reference = Utc::now();

        queue.enqueue_at(events(&["old"]), reference - Duration::hours(3));
        queue.enqueue_at(events(&["boundary"]), reference - Duration::hours(2));
        queue.enqueue_at(events(&["fresh"]), reference - Duration::minutes(5));

        let removed = queue.remove_old_dispatches(Duration::hours(2), Some(reference));
        assert_eq!(removed, 1);
        assert_eq!(names(&queue.release().unwrap()), vec!["boundary", "fresh"]);
    }

    #[test]
    fn test_remove_old_dispatches_before_enqueue_order_independent() {
        let (_, mut queue) = queue(100);
        let reference = Utc::now();

        // Purging an empty queue is a no-op
        assert_eq!(queue.remove_old_dispatches(Duration::hours(1), Some(reference)), 0);

        queue.enqueue_at(events(&["fresh"]), reference);
        queue.enqueue_at(events(&["old"]), reference - Duration::days(1));
        queue.remove_old_dispatches(Duration::hours(1), Some(reference));
        assert_eq!(names(&queue.release().unwrap()), vec!["fresh"]);
    }

    #[test]
    fn test_expiration_applied_on_enqueue_and_release() {
        let (_, queue) = queue(100);
        let mut queue = queue.with_expiration(Some(std::time::Duration::from_secs(60)));
        let now = Utc::now();

        queue.enqueue_at(events(&["stale"]), now - Duration::minutes(10));
        queue.enqueue_at(events(&["live"]), now);
        assert_eq!(queue.current_events(), 1);

        let released = queue.release_at(now + Duration::seconds(30)).unwrap();
        assert_eq!(names(&released), vec!["live"]);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_, mut queue) = queue(100);
        queue.enqueue(events(&["a", "b"]));

        queue.clear();
        assert_eq!(queue.current_events(), 0);
        queue.clear();
        assert_eq!(queue.current_events(), 0);
    }

    #[test]
    fn test_storage_failure_reads_as_empty() {
        let (store, mut queue) = queue(100);
        queue.enqueue(events(&["a"]));

        store.set_failing(true);
        assert_eq!(queue.current_events(), 0);
        queue.enqueue(events(&["b"]));
        assert!(queue.release().is_none());

        store.set_failing(false);
        assert_eq!(queue.current_events(), 1);
    }

    #[test]
    fn test_survives_new_queue_instance() {
        let (store, mut queue) = queue(100);
        queue.enqueue(events(&["persisted"]));

        let mut reopened = PersistentQueue::new(store as Arc<dyn DiskStore>, 100);
        assert_eq!(reopened.current_events(), 1);
        assert_eq!(
            reopened.release().unwrap().payloads()[0][keys::EVENT],
            json!("persisted")
        );
    }
}
