// Keyed timer arena. Each key has at most one armed timer; re-arming aborts
// the previous sleep. Fires come back to the actor as `InternalEvent::TimerFired`
// and are honoured only if their token is still current.

use std::collections::HashMap;
use std::time::Duration;

use flume::Sender;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::updates::{CoreMsg, InternalEvent};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Expiry of a peer's typing signal.
    Typing {
        conversation_id: String,
        peer_id: String,
    },
    /// Our own burst went quiet; send `typing-stop`.
    LocalTypingIdle { conversation_id: String },
    /// Zero-subscriber grace period.
    Eviction { conversation_id: String },
    Reconnect,
    ReconcileInterval,
    ReconcileRetry,
}

impl TimerKey {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            TimerKey::Typing {
                conversation_id, ..
            }
            | TimerKey::LocalTypingIdle { conversation_id }
            | TimerKey::Eviction { conversation_id } => Some(conversation_id),
            TimerKey::Reconnect | TimerKey::ReconcileInterval | TimerKey::ReconcileRetry => None,
        }
    }
}

struct ArmedTimer {
    token: u64,
    abort: AbortHandle,
}

pub(crate) struct TimerArena {
    runtime: Handle,
    core_sender: Sender<CoreMsg>,
    next_token: u64,
    armed: HashMap<TimerKey, ArmedTimer>,
}

impl TimerArena {
    pub fn new(runtime: Handle, core_sender: Sender<CoreMsg>) -> Self {
        Self {
            runtime,
            core_sender,
            next_token: 0,
            armed: HashMap::new(),
        }
    }

    /// Arms (or re-arms) `key`. Returns the token the fire will carry.
    pub fn arm(&mut self, key: TimerKey, delay: Duration) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        let tx = self.core_sender.clone();
        let fired = key.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::TimerFired {
                key: fired,
                token,
            })));
        });
        let timer = ArmedTimer {
            token,
            abort: task.abort_handle(),
        };
        if let Some(previous) = self.armed.insert(key, timer) {
            previous.abort.abort();
        }
        token
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    #[cfg(test)]
    pub fn token(&self, key: &TimerKey) -> Option<u64> {
        self.armed.get(key).map(|t| t.token)
    }

    /// Consumes a fire. Returns false if the key was re-armed or cancelled since.
    pub fn take_fired(&mut self, key: &TimerKey, token: u64) -> bool {
        match self.armed.get(key) {
            Some(timer) if timer.token == token => {
                self.armed.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.armed.remove(key) {
            Some(timer) => {
                timer.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_matching(&mut self, mut pred: impl FnMut(&TimerKey) -> bool) -> usize {
        let keys: Vec<TimerKey> = self.armed.keys().filter(|k| pred(k)).cloned().collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.abort.abort();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for TimerArena {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
