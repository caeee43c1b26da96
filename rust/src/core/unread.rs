// Unread counters: local deltas plus authoritative snapshots from the backend.

use std::collections::{HashMap, HashSet, VecDeque};

// The socket can redeliver the same message (reconnects, server fan-out).
// Keep a small bounded cache so a duplicate never double-counts.
const SEEN_MESSAGES_CAP: usize = 2048;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct UnreadCounter {
    pub count: u32,
    pub last_reconciled_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReconcileOutcome {
    Applied { changed: bool },
    /// Older than the last applied snapshot; ignored.
    Stale,
}

#[derive(Debug, Default)]
pub(crate) struct UnreadStore {
    counters: HashMap<String, UnreadCounter>,
    // Receipt times of increments not yet covered by a snapshot.
    recent: HashMap<String, Vec<u64>>,
    seen: HashSet<(String, String)>,
    seen_order: VecDeque<(String, String)>,
}

impl UnreadStore {
    pub fn increment(&mut self, conversation_id: &str, now: u64) -> u32 {
        let counter = self.counters.entry(conversation_id.to_string()).or_default();
        counter.count = counter.count.saturating_add(1);
        self.recent
            .entry(conversation_id.to_string())
            .or_default()
            .push(now);
        counter.count
    }

    /// Remembers a delivered message id. Returns false for a duplicate.
    pub fn mark_seen(&mut self, conversation_id: &str, message_id: &str) -> bool {
        let key = (conversation_id.to_string(), message_id.to_string());
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.seen_order.push_back(key);
        if self.seen_order.len() > SEEN_MESSAGES_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Resets the counter to zero. Returns true if it was non-zero.
    pub fn mark_read(&mut self, conversation_id: &str) -> bool {
        self.recent.remove(conversation_id);
        match self.counters.get_mut(conversation_id) {
            Some(counter) if counter.count > 0 => {
                counter.count = 0;
                true
            }
            _ => false,
        }
    }

    /// Overwrites the counter with an authoritative count unless `as_of` is
    /// older than the last reconciliation. Increments received after `as_of`
    /// are not in the snapshot yet and are replayed on top of it.
    pub fn reconcile(
        &mut self,
        conversation_id: &str,
        authoritative_count: u32,
        as_of: u64,
    ) -> ReconcileOutcome {
        let counter = self.counters.entry(conversation_id.to_string()).or_default();
        if counter.last_reconciled_at.is_some_and(|last| as_of < last) {
            return ReconcileOutcome::Stale;
        }
        let newer = match self.recent.get_mut(conversation_id) {
            Some(received) => {
                received.retain(|&at| at > as_of);
                let newer = received.len() as u32;
                if received.is_empty() {
                    self.recent.remove(conversation_id);
                }
                newer
            }
            None => 0,
        };
        let count = authoritative_count.saturating_add(newer);
        let changed = counter.count != count;
        counter.count = count;
        counter.last_reconciled_at = Some(as_of);
        ReconcileOutcome::Applied { changed }
    }

    pub fn count(&self, conversation_id: &str) -> u32 {
        self.counters
            .get(conversation_id)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    pub fn counter(&self, conversation_id: &str) -> Option<UnreadCounter> {
        self.counters.get(conversation_id).copied()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &String> {
        self.counters.keys()
    }

    pub fn evict_conversation(&mut self, conversation_id: &str) -> bool {
        self.recent.remove(conversation_id);
        self.counters.remove(conversation_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_overrides_accumulated_increments() {
        let mut store = UnreadStore::default();
        store.increment("c2", 100);
        store.increment("c2", 200);
        assert_eq!(store.increment("c2", 300), 3);
        assert_eq!(
            store.reconcile("c2", 1, 1_000),
            ReconcileOutcome::Applied { changed: true }
        );
        assert_eq!(store.count("c2"), 1);
    }

    #[test]
    fn increments_newer_than_snapshot_survive_it() {
        let mut store = UnreadStore::default();
        store.increment("c1", 900);
        store.increment("c1", 1_100);
        store.increment("c1", 1_200);
        // The snapshot already counts the message received at 900.
        assert_eq!(
            store.reconcile("c1", 4, 1_000),
            ReconcileOutcome::Applied { changed: true }
        );
        assert_eq!(store.count("c1"), 6);

        // A later snapshot covers everything seen so far.
        store.reconcile("c1", 6, 1_500);
        assert_eq!(store.count("c1"), 6);
        assert_eq!(store.recent.get("c1"), None);
    }

    #[test]
    fn mark_read_drops_pending_increments() {
        let mut store = UnreadStore::default();
        store.increment("c1", 2_000);
        store.mark_read("c1");
        store.reconcile("c1", 0, 1_000);
        assert_eq!(store.count("c1"), 0);
    }

    #[test]
    fn older_snapshot_is_a_no_op() {
        let mut store = UnreadStore::default();
        store.reconcile("c1", 4, 2_000);
        assert_eq!(store.reconcile("c1", 9, 1_999), ReconcileOutcome::Stale);
        assert_eq!(
            store.counter("c1"),
            Some(UnreadCounter {
                count: 4,
                last_reconciled_at: Some(2_000)
            })
        );
    }

    #[test]
    fn equal_timestamp_still_applies() {
        let mut store = UnreadStore::default();
        store.reconcile("c1", 4, 2_000);
        assert_eq!(
            store.reconcile("c1", 4, 2_000),
            ReconcileOutcome::Applied { changed: false }
        );
        assert_eq!(
            store.reconcile("c1", 0, 2_000),
            ReconcileOutcome::Applied { changed: true }
        );
    }

    #[test]
    fn mark_read_reports_changes_only() {
        let mut store = UnreadStore::default();
        assert!(!store.mark_read("c1"));
        store.increment("c1", 10);
        assert!(store.mark_read("c1"));
        assert_eq!(store.count("c1"), 0);
        assert!(!store.mark_read("c1"));
    }

    #[test]
    fn duplicate_message_ids_are_detected_per_conversation() {
        let mut store = UnreadStore::default();
        assert!(store.mark_seen("c1", "m1"));
        assert!(!store.mark_seen("c1", "m1"));
        assert!(store.mark_seen("c2", "m1"));
    }

    #[test]
    fn seen_cache_is_bounded() {
        let mut store = UnreadStore::default();
        for i in 0..(SEEN_MESSAGES_CAP + 10) {
            store.mark_seen("c1", &format!("m{i}"));
        }
        assert_eq!(store.seen.len(), SEEN_MESSAGES_CAP);
        // The oldest ids aged out and would count again.
        assert!(store.mark_seen("c1", "m0"));
        assert!(!store.mark_seen("c1", &format!("m{}", SEEN_MESSAGES_CAP + 9)));
    }

    #[test]
    fn evict_forgets_counter_and_watermark() {
        let mut store = UnreadStore::default();
        store.reconcile("c1", 2, 5_000);
        assert!(store.evict_conversation("c1"));
        assert_eq!(store.count("c1"), 0);
        assert_eq!(
            store.reconcile("c1", 1, 10),
            ReconcileOutcome::Applied { changed: true }
        );
    }
}
