use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect budget exhausted; typing data is unknown until a new attempt.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub conversation_id: String,
    /// Live typing peers, sorted. Empty when presence is unavailable.
    pub typing_peers: Vec<String>,
    pub unread_count: u32,
    pub connection: ConnectionState,
}

impl ConversationView {
    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.typing_peers.iter().any(|p| p == peer_id)
    }
}

/// Read-only snapshot published by the actor after every change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub rev: u64,
    pub connection: ConnectionState,
    /// Views of subscribed conversations.
    pub conversations: BTreeMap<String, ConversationView>,
    /// Unread badge for every conversation with a counter, subscribed or not.
    pub unread: BTreeMap<String, u32>,
}

impl PresenceState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&ConversationView> {
        self.conversations.get(conversation_id)
    }
}

pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_millis()
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
