use std::sync::Weak;

use crate::core::{TimerKey, UnreadSnapshot};
use crate::state::ConversationView;
use crate::{AppAction, ConversationObserver};

#[derive(Debug)]
pub(crate) enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
    Subscribe {
        id: u64,
        conversation_id: String,
        observer: Weak<dyn ConversationObserver>,
    },
    Unsubscribe {
        id: u64,
    },
}

#[derive(Debug)]
pub(crate) enum InternalEvent {
    // Transport receive path
    TransportOpened {
        generation: u64,
    },
    TransportFrame {
        generation: u64,
        text: String,
    },
    TransportClosed {
        generation: u64,
        reason: Option<String>,
    },

    // Keyed timers
    TimerFired {
        key: TimerKey,
        token: u64,
    },

    // Async backend results
    UnreadSnapshotFetched {
        token: u64,
        result: Result<UnreadSnapshot, String>,
    },
    MembersFetched {
        conversation_id: String,
        result: Result<Vec<String>, String>,
    },
}

/// One view change fanned out to the observers registered for it.
pub(crate) struct Notification {
    pub view: ConversationView,
    pub observers: Vec<Weak<dyn ConversationObserver>>,
}

impl Notification {
    pub fn deliver(self) {
        for observer in self.observers {
            if let Some(observer) = observer.upgrade() {
                observer.on_change(self.view.clone());
            }
        }
    }
}
