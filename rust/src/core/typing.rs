// Typing signals: per-conversation, per-peer, expiring at a fixed TTL after receipt.
//
// Purely in-memory and clock-agnostic: every call takes `now` in epoch millis.
// Timer scheduling lives in the actor; this module only answers "what changed".

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordOutcome {
    /// The peer had no live signal before this call.
    pub became_live: bool,
    pub expires_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Expiry {
    /// The signal lapsed and was removed.
    Expired,
    /// The signal was refreshed since the timer was armed.
    Pending { remaining_ms: u64 },
    Missing,
}

#[derive(Debug, Default)]
pub(crate) struct TypingStore {
    // conversation_id -> (peer_id -> expires_at_ms)
    signals: HashMap<String, HashMap<String, u64>>,
}

impl TypingStore {
    /// Inserts or refreshes the signal for `(conversation_id, peer_id)`.
    pub fn record_typing(
        &mut self,
        conversation_id: &str,
        peer_id: &str,
        now: u64,
        timeout_ms: u64,
    ) -> RecordOutcome {
        let expires_at = now.saturating_add(timeout_ms);
        let peers = self.signals.entry(conversation_id.to_string()).or_default();
        let previous = peers.insert(peer_id.to_string(), expires_at);
        RecordOutcome {
            became_live: !matches!(previous, Some(prev) if prev > now),
            expires_at,
        }
    }

    /// Removes the signal. Returns true only if a live signal was removed.
    pub fn clear_typing(&mut self, conversation_id: &str, peer_id: &str, now: u64) -> bool {
        let Some(peers) = self.signals.get_mut(conversation_id) else {
            return false;
        };
        let removed = peers.remove(peer_id);
        if peers.is_empty() {
            self.signals.remove(conversation_id);
        }
        matches!(removed, Some(expires_at) if expires_at > now)
    }

    pub fn expire(&mut self, conversation_id: &str, peer_id: &str, now: u64) -> Expiry {
        let Some(peers) = self.signals.get_mut(conversation_id) else {
            return Expiry::Missing;
        };
        let Some(&expires_at) = peers.get(peer_id) else {
            return Expiry::Missing;
        };
        if expires_at > now {
            return Expiry::Pending {
                remaining_ms: expires_at - now,
            };
        }
        peers.remove(peer_id);
        if peers.is_empty() {
            self.signals.remove(conversation_id);
        }
        Expiry::Expired
    }

    #[cfg(test)]
    pub fn is_typing(&self, conversation_id: &str, peer_id: &str, now: u64) -> bool {
        self.signals
            .get(conversation_id)
            .and_then(|peers| peers.get(peer_id))
            .is_some_and(|&expires_at| expires_at > now)
    }

    pub fn typing_peers(&self, conversation_id: &str, now: u64) -> BTreeSet<String> {
        self.live(conversation_id, now)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Live peers restricted to the conversation's known members.
    pub fn group_typing_peers(
        &self,
        conversation_id: &str,
        members: &HashSet<String>,
        now: u64,
    ) -> BTreeSet<String> {
        self.live(conversation_id, now)
            .filter(|(peer, _)| members.contains(peer.as_str()))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// `(peer_id, remaining_ms)` for every live signal in the conversation.
    pub fn live_signals(&self, conversation_id: &str, now: u64) -> Vec<(String, u64)> {
        self.live(conversation_id, now)
            .map(|(peer, expires_at)| (peer.clone(), expires_at - now))
            .collect()
    }

    pub fn evict_conversation(&mut self, conversation_id: &str) -> bool {
        self.signals.remove(conversation_id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.signals.clear();
    }

    #[cfg(test)]
    pub fn conversation_count(&self) -> usize {
        self.signals.len()
    }

    fn live<'a>(
        &'a self,
        conversation_id: &str,
        now: u64,
    ) -> impl Iterator<Item = (&'a String, u64)> + 'a {
        self.signals
            .get(conversation_id)
            .into_iter()
            .flat_map(|peers| peers.iter())
            .filter(move |entry| *entry.1 > now)
            .map(|(peer, expires_at)| (peer, *expires_at))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IdleCheck {
    Idle,
    Active { remaining_ms: u64 },
    NoBurst,
}

#[derive(Clone, Copy, Debug)]
struct Burst {
    last_start_sent: u64,
    last_keystroke: u64,
}

/// Debounces our own outbound typing events: one `typing-start` per resend
/// window while a burst lasts, one `typing-stop` when it ends.
#[derive(Debug, Default)]
pub(crate) struct TypingDebouncer {
    bursts: HashMap<String, Burst>,
}

impl TypingDebouncer {
    /// Records a keystroke. Returns true when a `typing-start` should go out.
    pub fn keystroke(&mut self, conversation_id: &str, now: u64, resend_ms: u64) -> bool {
        match self.bursts.get_mut(conversation_id) {
            Some(burst) => {
                burst.last_keystroke = now;
                if now.saturating_sub(burst.last_start_sent) >= resend_ms {
                    burst.last_start_sent = now;
                    true
                } else {
                    false
                }
            }
            None => {
                self.bursts.insert(
                    conversation_id.to_string(),
                    Burst {
                        last_start_sent: now,
                        last_keystroke: now,
                    },
                );
                true
            }
        }
    }

    pub fn check_idle(&self, conversation_id: &str, now: u64, idle_ms: u64) -> IdleCheck {
        let Some(burst) = self.bursts.get(conversation_id) else {
            return IdleCheck::NoBurst;
        };
        let idle_at = burst.last_keystroke.saturating_add(idle_ms);
        if now >= idle_at {
            IdleCheck::Idle
        } else {
            IdleCheck::Active {
                remaining_ms: idle_at - now,
            }
        }
    }

    /// Ends the burst. Returns true if one was active.
    pub fn stop(&mut self, conversation_id: &str) -> bool {
        self.bursts.remove(conversation_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: u64 = 3_000;

    #[test]
    fn refresh_within_timeout_keeps_peer_typing() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        let refresh = store.record_typing("c1", "A", 2_000, TIMEOUT);
        assert!(!refresh.became_live, "refresh of a live signal is not a change");
        assert_eq!(refresh.expires_at, 5_000);

        assert!(store.is_typing("c1", "A", 2_900));
        assert!(store.is_typing("c1", "A", 4_900), "refreshed at t=2000");
        assert!(!store.is_typing("c1", "A", 5_100));
    }

    #[test]
    fn gap_of_full_timeout_ends_typing() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        assert!(store.is_typing("c1", "A", 2_999));
        assert!(!store.is_typing("c1", "A", 3_000));

        let again = store.record_typing("c1", "A", 3_000, TIMEOUT);
        assert!(again.became_live, "a lapsed signal coming back is a change");
    }

    #[test]
    fn clear_is_immediate_and_reports_only_real_changes() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        assert!(store.clear_typing("c1", "A", 100));
        assert!(!store.is_typing("c1", "A", 100));
        assert!(!store.clear_typing("c1", "A", 100), "second clear is a no-op");
        assert!(!store.clear_typing("c9", "Z", 100), "unknown peer is a no-op");
    }

    #[test]
    fn clearing_a_lapsed_signal_is_not_a_change() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        assert!(!store.clear_typing("c1", "A", 4_000));
        assert_eq!(store.conversation_count(), 0);
    }

    #[test]
    fn stop_then_late_start_leaves_peer_typing_until_timeout() {
        // Reordered delivery: the stop overtook the start. Last write wins and
        // the stale indicator is bounded by the timeout.
        let mut store = TypingStore::default();
        assert!(!store.clear_typing("c1", "A", 0));
        store.record_typing("c1", "A", 10, TIMEOUT);
        assert!(store.is_typing("c1", "A", 3_000));
        assert!(!store.is_typing("c1", "A", 3_010));
    }

    #[test]
    fn expire_distinguishes_refreshed_signals() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        store.record_typing("c1", "A", 2_000, TIMEOUT);
        assert_eq!(
            store.expire("c1", "A", 3_000),
            Expiry::Pending { remaining_ms: 2_000 }
        );
        assert_eq!(store.expire("c1", "A", 5_000), Expiry::Expired);
        assert_eq!(store.expire("c1", "A", 5_000), Expiry::Missing);
        assert_eq!(store.conversation_count(), 0);
    }

    #[test]
    fn typing_peers_and_group_filter() {
        let mut store = TypingStore::default();
        store.record_typing("g1", "alice", 0, TIMEOUT);
        store.record_typing("g1", "bob", 0, TIMEOUT);
        store.record_typing("g1", "mallory", 0, TIMEOUT);
        store.record_typing("g1", "carol", 0, 500);

        let peers: Vec<_> = store.typing_peers("g1", 1_000).into_iter().collect();
        assert_eq!(peers, vec!["alice", "bob", "mallory"]);

        let members: HashSet<String> = ["alice", "bob", "carol"]
            .into_iter()
            .map(String::from)
            .collect();
        let group: Vec<_> = store
            .group_typing_peers("g1", &members, 1_000)
            .into_iter()
            .collect();
        assert_eq!(group, vec!["alice", "bob"]);
        assert!(store.typing_peers("other", 0).is_empty());
    }

    #[test]
    fn live_signals_report_remaining_time() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 1_000, TIMEOUT);
        store.record_typing("c1", "B", 0, 500);
        assert_eq!(store.live_signals("c1", 1_500), vec![("A".to_string(), 2_500)]);
    }

    #[test]
    fn evict_drops_whole_conversation() {
        let mut store = TypingStore::default();
        store.record_typing("c1", "A", 0, TIMEOUT);
        store.record_typing("c2", "B", 0, TIMEOUT);
        assert!(store.evict_conversation("c1"));
        assert!(!store.evict_conversation("c1"));
        assert!(!store.is_typing("c1", "A", 1));
        assert!(store.is_typing("c2", "B", 1));
    }

    #[test]
    fn debouncer_sends_one_start_per_window() {
        let mut debouncer = TypingDebouncer::default();
        assert!(debouncer.keystroke("c1", 0, 2_000));
        assert!(!debouncer.keystroke("c1", 500, 2_000));
        assert!(!debouncer.keystroke("c1", 1_999, 2_000));
        assert!(debouncer.keystroke("c1", 2_000, 2_000), "resend keeps peers alive");
        assert!(debouncer.keystroke("c2", 2_100, 2_000), "windows are per conversation");
    }

    #[test]
    fn debouncer_idle_tracks_last_keystroke() {
        let mut debouncer = TypingDebouncer::default();
        assert_eq!(debouncer.check_idle("c1", 0, 3_000), IdleCheck::NoBurst);
        debouncer.keystroke("c1", 0, 2_000);
        debouncer.keystroke("c1", 1_000, 2_000);
        assert_eq!(
            debouncer.check_idle("c1", 3_000, 3_000),
            IdleCheck::Active { remaining_ms: 1_000 }
        );
        assert_eq!(debouncer.check_idle("c1", 4_000, 3_000), IdleCheck::Idle);
        assert!(debouncer.stop("c1"));
        assert!(!debouncer.stop("c1"));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn refreshes_inside_timeout_keep_peer_typing_throughout(
                gaps in prop::collection::vec(1..TIMEOUT, 1..25),
            ) {
                let mut store = TypingStore::default();
                let mut now = 0;
                store.record_typing("c1", "A", now, TIMEOUT);
                for gap in gaps {
                    for probe in [now, now + gap / 2, now + gap - 1] {
                        prop_assert!(store.is_typing("c1", "A", probe), "lapsed at {}", probe);
                    }
                    now += gap;
                    let refresh = store.record_typing("c1", "A", now, TIMEOUT);
                    prop_assert!(!refresh.became_live);
                }
                prop_assert!(store.is_typing("c1", "A", now + TIMEOUT - 1));
                prop_assert!(!store.is_typing("c1", "A", now + TIMEOUT));
            }

            #[test]
            fn gap_of_at_least_timeout_ends_typing(
                start in 0u64..1_000_000,
                extra in 0u64..10 * TIMEOUT,
            ) {
                let mut store = TypingStore::default();
                store.record_typing("c1", "A", start, TIMEOUT);
                let later = start + TIMEOUT + extra;
                prop_assert!(!store.is_typing("c1", "A", later));
                prop_assert!(store.record_typing("c1", "A", later, TIMEOUT).became_live);
            }
        }
    }
}
