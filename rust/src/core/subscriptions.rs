// Registry of observers per conversation. Only weak references are held.

use std::collections::{BTreeSet, HashMap};
use std::sync::Weak;

use crate::ConversationObserver;

struct Entry {
    conversation_id: String,
    observer: Weak<dyn ConversationObserver>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_id: HashMap<u64, Entry>,
    // conversation_id -> subscription ids
    by_conversation: HashMap<String, BTreeSet<u64>>,
}

impl SubscriptionRegistry {
    /// Returns the conversation's subscriber count after adding.
    pub fn add(
        &mut self,
        id: u64,
        conversation_id: &str,
        observer: Weak<dyn ConversationObserver>,
    ) -> usize {
        if let Some(previous) = self.by_id.insert(
            id,
            Entry {
                conversation_id: conversation_id.to_string(),
                observer,
            },
        ) {
            self.detach(id, &previous.conversation_id);
        }
        let ids = self
            .by_conversation
            .entry(conversation_id.to_string())
            .or_default();
        ids.insert(id);
        ids.len()
    }

    /// Returns `(conversation_id, remaining subscribers)` if `id` was registered.
    pub fn remove(&mut self, id: u64) -> Option<(String, usize)> {
        let entry = self.by_id.remove(&id)?;
        let remaining = self.detach(id, &entry.conversation_id);
        Some((entry.conversation_id, remaining))
    }

    pub fn count(&self, conversation_id: &str) -> usize {
        self.by_conversation
            .get(conversation_id)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.count(conversation_id) > 0
    }

    pub fn total(&self) -> usize {
        self.by_id.len()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &String> {
        self.by_conversation.keys()
    }

    /// Observers for `conversation_id` whose owner is still alive.
    pub fn observers(&self, conversation_id: &str) -> Vec<Weak<dyn ConversationObserver>> {
        let Some(ids) = self.by_conversation.get(conversation_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|entry| entry.observer.strong_count() > 0)
            .map(|entry| entry.observer.clone())
            .collect()
    }

    /// Drops subscriptions whose observer was dropped without unsubscribing.
    /// Returns conversations that lost their last subscriber.
    pub fn prune_dead(&mut self) -> Vec<String> {
        let dead: Vec<u64> = self
            .by_id
            .iter()
            .filter(|(_, entry)| entry.observer.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut emptied = Vec::new();
        for id in dead {
            if let Some((conversation_id, 0)) = self.remove(id) {
                emptied.push(conversation_id);
            }
        }
        emptied
    }

    fn detach(&mut self, id: u64, conversation_id: &str) -> usize {
        let Some(ids) = self.by_conversation.get_mut(conversation_id) else {
            return 0;
        };
        ids.remove(&id);
        let remaining = ids.len();
        if remaining == 0 {
            self.by_conversation.remove(conversation_id);
        }
        remaining
    }
}
