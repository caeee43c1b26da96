mod backend;
mod config;
mod connection;
mod reconcile;
pub mod router;
mod subscriptions;
mod timers;
mod transport;
mod typing;
mod unread;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use flume::Sender;

use crate::actions::AppAction;
use crate::error::PresenceError;
use crate::state::{Clock, ConnectionState, ConversationView, PresenceState};
use crate::updates::{CoreMsg, InternalEvent, Notification};
use crate::{Collaborators, ConversationObserver};

pub use backend::{Backend, HttpBackend, UnreadEntry, UnreadSnapshot};
pub use config::{load_app_config, AppConfig};
pub use router::{EventSink, WireEvent};
pub(crate) use timers::TimerKey;
pub use transport::{
    BackoffPolicy, ConnectionHandle, Connector, SocketTimeouts, TransportEvents, WsConnector,
};

use subscriptions::SubscriptionRegistry;
use timers::TimerArena;
use transport::Backoff;
use typing::{Expiry, IdleCheck, TypingDebouncer, TypingStore};
use unread::{ReconcileOutcome, UnreadStore};

pub(crate) struct AppCore {
    pub state: PresenceState,
    rev: u64,

    current_user_id: String,
    config: AppConfig,
    clock: Arc<dyn Clock>,
    connector: Option<Arc<dyn Connector>>,
    backend: Option<Arc<dyn Backend>>,

    core_sender: Sender<CoreMsg>,
    notify_sender: Sender<Notification>,
    shared_state: Arc<RwLock<PresenceState>>,
    runtime: tokio::runtime::Runtime,
    timers: TimerArena,

    // Transport lifecycle.
    connection: Option<ConnectionHandle>,
    generation: u64,
    connect_requested: bool,
    reconnect_backoff: Backoff,
    shut_down: bool,

    // Single-flight unread reconciliation.
    reconcile_in_flight: bool,
    reconcile_dirty: bool,
    reconcile_token: u64,
    reconcile_backoff: Backoff,

    typing: TypingStore,
    debouncer: TypingDebouncer,
    unread: UnreadStore,
    // conversation_id -> member ids (GroupTypingSet filter)
    members: HashMap<String, HashSet<String>>,
    members_in_flight: HashSet<String>,
    focused: Option<String>,
    subscriptions: SubscriptionRegistry,
}

impl AppCore {
    pub fn new(
        config: AppConfig,
        current_user_id: String,
        collaborators: Collaborators,
        core_sender: Sender<CoreMsg>,
        notify_sender: Sender<Notification>,
        shared_state: Arc<RwLock<PresenceState>>,
    ) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let (connector, backend) = if config.network_disabled() {
            tracing::info!("network disabled: presence runs offline");
            (None, None)
        } else {
            (collaborators.connector, collaborators.backend)
        };
        let timers = TimerArena::new(runtime.handle().clone(), core_sender.clone());
        let policy = config.backoff_policy();

        let this = Self {
            state: PresenceState::empty(),
            rev: 0,
            current_user_id,
            config,
            clock: collaborators.clock,
            connector,
            backend,
            core_sender,
            notify_sender,
            shared_state,
            runtime,
            timers,
            connection: None,
            generation: 0,
            connect_requested: false,
            reconnect_backoff: Backoff::new(policy),
            shut_down: false,
            reconcile_in_flight: false,
            reconcile_dirty: false,
            reconcile_token: 0,
            reconcile_backoff: Backoff::new(policy),
            typing: TypingStore::default(),
            debouncer: TypingDebouncer::default(),
            unread: UnreadStore::default(),
            members: HashMap::new(),
            members_in_flight: HashSet::new(),
            focused: None,
            subscriptions: SubscriptionRegistry::default(),
        };
        this.publish_snapshot();
        this
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        if self.shut_down {
            return;
        }
        match msg {
            CoreMsg::Action(action) => {
                tracing::debug!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Subscribe {
                id,
                conversation_id,
                observer,
            } => self.subscribe(id, conversation_id, observer),
            CoreMsg::Unsubscribe { id } => self.unsubscribe(id),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Connect => {
                self.connect_requested = true;
                self.connect();
            }
            AppAction::Shutdown => self.shutdown(),
            AppAction::TypingStarted { conversation_id } => {
                self.local_typing_started(&conversation_id)
            }
            AppAction::TypingStopped { conversation_id } => {
                self.local_typing_stopped(&conversation_id)
            }
            AppAction::MarkRead { conversation_id } => self.mark_read(&conversation_id),
            AppAction::FocusConversation { conversation_id } => {
                self.focused = conversation_id.clone();
                if let Some(id) = conversation_id {
                    self.mark_read(&id);
                }
            }
            AppAction::RefreshUnread => self.request_reconcile("on-demand"),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::TransportOpened { generation } => {
                self.handle_transport_opened(generation)
            }
            InternalEvent::TransportFrame { generation, text } => {
                if generation != self.generation {
                    return;
                }
                match router::route(&text, self) {
                    Ok(tag) => tracing::trace!(tag, "routed"),
                    Err(PresenceError::UnknownEvent(tag)) => {
                        tracing::debug!(%tag, "dropping unknown event")
                    }
                    Err(e) => tracing::warn!(%e, "dropping event"),
                }
            }
            InternalEvent::TransportClosed { generation, reason } => {
                self.handle_transport_closed(generation, reason)
            }
            InternalEvent::TimerFired { key, token } => self.handle_timer_fired(key, token),
            InternalEvent::UnreadSnapshotFetched { token, result } => {
                self.handle_unread_snapshot_fetched(token, result)
            }
            InternalEvent::MembersFetched {
                conversation_id,
                result,
            } => self.handle_members_fetched(conversation_id, result),
        }
    }

    fn handle_timer_fired(&mut self, key: TimerKey, token: u64) {
        if !self.timers.take_fired(&key, token) {
            return;
        }
        match key {
            TimerKey::Typing {
                conversation_id,
                peer_id,
            } => {
                let now = self.now_ms();
                match self.typing.expire(&conversation_id, &peer_id, now) {
                    Expiry::Expired => self.emit_conversation(&conversation_id),
                    // Refreshed since arming: wait out the remainder.
                    Expiry::Pending { remaining_ms } => {
                        if self.subscriptions.is_subscribed(&conversation_id) {
                            self.timers.arm(
                                TimerKey::Typing {
                                    conversation_id,
                                    peer_id,
                                },
                                Duration::from_millis(remaining_ms),
                            );
                        }
                    }
                    Expiry::Missing => {}
                }
            }
            TimerKey::LocalTypingIdle { conversation_id } => {
                let now = self.now_ms();
                let idle_ms = self.config.local_typing_idle_ms();
                match self.debouncer.check_idle(&conversation_id, now, idle_ms) {
                    IdleCheck::Idle => {
                        self.debouncer.stop(&conversation_id);
                        self.send_own_typing(&conversation_id, false);
                    }
                    IdleCheck::Active { remaining_ms } => {
                        self.timers.arm(
                            TimerKey::LocalTypingIdle { conversation_id },
                            Duration::from_millis(remaining_ms),
                        );
                    }
                    IdleCheck::NoBurst => {}
                }
            }
            TimerKey::Eviction { conversation_id } => {
                if !self.subscriptions.is_subscribed(&conversation_id) {
                    self.evict_conversation(&conversation_id);
                }
            }
            TimerKey::Reconnect => self.handle_reconnect_due(),
            TimerKey::ReconcileInterval => {
                self.prune_dead_observers();
                if self.subscriptions.total() > 0 {
                    self.request_reconcile("interval");
                    self.ensure_reconcile_interval();
                }
            }
            TimerKey::ReconcileRetry => self.request_reconcile("retry"),
        }
    }

    // Subscriptions

    fn subscribe(
        &mut self,
        id: u64,
        conversation_id: String,
        observer: Weak<dyn ConversationObserver>,
    ) {
        let first_overall = self.subscriptions.total() == 0;
        let count = self
            .subscriptions
            .add(id, &conversation_id, observer.clone());
        tracing::debug!(conversation_id = %conversation_id, subscribers = count, "subscribe");

        if count == 1 {
            self.timers.cancel(&TimerKey::Eviction {
                conversation_id: conversation_id.clone(),
            });
            self.arm_live_typing_timers(&conversation_id);
            self.ensure_members(&conversation_id);
        }
        if first_overall {
            self.ensure_reconcile_interval();
            if self.connector.is_some() {
                self.connect();
            } else {
                self.request_reconcile("first-subscription");
            }
        }

        let view = self.conversation_view(&conversation_id);
        self.state
            .conversations
            .insert(conversation_id.clone(), view.clone());
        self.commit_state();
        let _ = self.notify_sender.send(Notification {
            view,
            observers: vec![observer],
        });
    }

    fn unsubscribe(&mut self, id: u64) {
        let Some((conversation_id, remaining)) = self.subscriptions.remove(id) else {
            return;
        };
        tracing::debug!(conversation_id = %conversation_id, subscribers = remaining, "unsubscribe");
        if remaining == 0 {
            self.conversation_idle(&conversation_id);
        }
        if self.subscriptions.total() == 0 {
            self.timers.cancel(&TimerKey::ReconcileInterval);
        }
    }

    /// The conversation lost its last subscriber: stop its timers and start
    /// the eviction grace period.
    fn conversation_idle(&mut self, conversation_id: &str) {
        self.timers.cancel_matching(|key| {
            matches!(key, TimerKey::Typing { .. }) && key.conversation_id() == Some(conversation_id)
        });
        self.ensure_eviction_armed(conversation_id);
        if self.state.conversations.remove(conversation_id).is_some() {
            self.commit_state();
        }
    }

    fn ensure_eviction_armed(&mut self, conversation_id: &str) {
        if self.subscriptions.is_subscribed(conversation_id) {
            return;
        }
        let key = TimerKey::Eviction {
            conversation_id: conversation_id.to_string(),
        };
        if !self.timers.is_armed(&key) {
            self.timers.arm(key, self.config.eviction_grace());
        }
    }

    fn evict_conversation(&mut self, conversation_id: &str) {
        tracing::debug!(conversation_id, "evicting idle conversation");
        self.typing.evict_conversation(conversation_id);
        self.unread.evict_conversation(conversation_id);
        self.members.remove(conversation_id);
        if self.debouncer.stop(conversation_id) {
            self.timers.cancel(&TimerKey::LocalTypingIdle {
                conversation_id: conversation_id.to_string(),
            });
        }
        let had_view = self.state.conversations.remove(conversation_id).is_some();
        let had_badge = self.state.unread.remove(conversation_id).is_some();
        if had_view || had_badge {
            self.commit_state();
        }
    }

    fn prune_dead_observers(&mut self) {
        for conversation_id in self.subscriptions.prune_dead() {
            tracing::debug!(conversation_id = %conversation_id, "observer dropped without unsubscribing");
            self.conversation_idle(&conversation_id);
        }
        if self.subscriptions.total() == 0 {
            self.timers.cancel(&TimerKey::ReconcileInterval);
        }
    }

    fn arm_live_typing_timers(&mut self, conversation_id: &str) {
        let now = self.now_ms();
        for (peer_id, remaining_ms) in self.typing.live_signals(conversation_id, now) {
            self.timers.arm(
                TimerKey::Typing {
                    conversation_id: conversation_id.to_string(),
                    peer_id,
                },
                Duration::from_millis(remaining_ms),
            );
        }
    }

    // Local actions

    fn local_typing_started(&mut self, conversation_id: &str) {
        let now = self.now_ms();
        if self
            .debouncer
            .keystroke(conversation_id, now, self.config.typing_resend_ms())
        {
            self.send_own_typing(conversation_id, true);
        }
        let key = TimerKey::LocalTypingIdle {
            conversation_id: conversation_id.to_string(),
        };
        if !self.timers.is_armed(&key) {
            let idle = Duration::from_millis(self.config.local_typing_idle_ms());
            self.timers.arm(key, idle);
        }
    }

    fn local_typing_stopped(&mut self, conversation_id: &str) {
        if !self.debouncer.stop(conversation_id) {
            return;
        }
        self.timers.cancel(&TimerKey::LocalTypingIdle {
            conversation_id: conversation_id.to_string(),
        });
        self.send_own_typing(conversation_id, false);
    }

    fn send_own_typing(&mut self, conversation_id: &str, typing: bool) {
        let conversation_id = conversation_id.to_string();
        let peer_id = self.current_user_id.clone();
        let event = if typing {
            WireEvent::TypingStart {
                conversation_id,
                peer_id,
            }
        } else {
            WireEvent::TypingStop {
                conversation_id,
                peer_id,
            }
        };
        self.send_wire(event);
    }

    fn mark_read(&mut self, conversation_id: &str) {
        let changed = self.unread.mark_read(conversation_id);
        self.send_wire(WireEvent::MessageRead {
            conversation_id: conversation_id.to_string(),
            peer_id: self.current_user_id.clone(),
        });
        if changed {
            self.emit_conversation(conversation_id);
        }
    }

    // Views and snapshots

    fn conversation_view(&self, conversation_id: &str) -> ConversationView {
        let connection = self.state.connection;
        let typing_peers = if connection == ConnectionState::Unavailable {
            Vec::new()
        } else {
            let now = self.now_ms();
            let peers = match self.members.get(conversation_id) {
                Some(members) => self.typing.group_typing_peers(conversation_id, members, now),
                None => self.typing.typing_peers(conversation_id, now),
            };
            peers.into_iter().collect()
        };
        ConversationView {
            conversation_id: conversation_id.to_string(),
            typing_peers,
            unread_count: self.unread.count(conversation_id),
            connection,
        }
    }

    /// Brings the snapshot entries for `conversation_id` up to date and
    /// notifies observers if their view changed. Does not commit.
    fn refresh_conversation(&mut self, conversation_id: &str) -> bool {
        let badge_changed = match self.unread.counter(conversation_id) {
            Some(counter) => {
                self.state
                    .unread
                    .insert(conversation_id.to_string(), counter.count)
                    != Some(counter.count)
            }
            None => self.state.unread.remove(conversation_id).is_some(),
        };

        if !self.subscriptions.is_subscribed(conversation_id) {
            let dropped = self.state.conversations.remove(conversation_id).is_some();
            return badge_changed || dropped;
        }
        let view = self.conversation_view(conversation_id);
        if self.state.conversations.get(conversation_id) == Some(&view) {
            return badge_changed;
        }
        self.state
            .conversations
            .insert(conversation_id.to_string(), view.clone());
        self.notify(view);
        true
    }

    fn emit_conversation(&mut self, conversation_id: &str) {
        if self.refresh_conversation(conversation_id) {
            self.commit_state();
        }
    }

    fn emit_all(&mut self) {
        let mut ids: HashSet<String> = self.subscriptions.conversation_ids().cloned().collect();
        ids.extend(self.state.conversations.keys().cloned());
        for id in ids {
            self.refresh_conversation(&id);
        }
        self.commit_state();
    }

    fn notify(&mut self, view: ConversationView) {
        let observers = self.subscriptions.observers(&view.conversation_id);
        let dead = observers.len() < self.subscriptions.count(&view.conversation_id);
        if !observers.is_empty() {
            let _ = self.notify_sender.send(Notification { view, observers });
        }
        if dead {
            self.prune_dead_observers();
        }
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state(&mut self) {
        self.next_rev();
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        match self.shared_state.write() {
            Ok(mut g) => *g = self.state.clone(),
            Err(poison) => *poison.into_inner() = self.state.clone(),
        }
    }
}

impl EventSink for AppCore {
    fn typing_started(&mut self, conversation_id: &str, peer_id: &str) {
        if peer_id == self.current_user_id {
            return;
        }
        let now = self.now_ms();
        let timeout_ms = self.config.typing_timeout_ms();
        let outcome = self
            .typing
            .record_typing(conversation_id, peer_id, now, timeout_ms);

        if self.subscriptions.is_subscribed(conversation_id) {
            let key = TimerKey::Typing {
                conversation_id: conversation_id.to_string(),
                peer_id: peer_id.to_string(),
            };
            // A refresh keeps the armed timer; it re-arms for the remainder when it fires.
            if outcome.became_live || !self.timers.is_armed(&key) {
                self.timers.arm(key, self.config.typing_timeout());
            }
        } else {
            self.ensure_eviction_armed(conversation_id);
        }

        if outcome.became_live {
            self.emit_conversation(conversation_id);
        }
    }

    fn typing_stopped(&mut self, conversation_id: &str, peer_id: &str) {
        if peer_id == self.current_user_id {
            return;
        }
        let now = self.now_ms();
        let removed = self.typing.clear_typing(conversation_id, peer_id, now);
        self.timers.cancel(&TimerKey::Typing {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
        });
        if removed {
            self.emit_conversation(conversation_id);
        }
    }

    fn message_received(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        sender_id: Option<&str>,
    ) {
        if !self.unread.mark_seen(conversation_id, message_id) {
            tracing::debug!(conversation_id, message_id, "duplicate message-new");
            return;
        }
        let now = self.now_ms();
        let mut changed = false;
        if let Some(sender) = sender_id {
            if self.typing.clear_typing(conversation_id, sender, now) {
                changed = true;
            }
            self.timers.cancel(&TimerKey::Typing {
                conversation_id: conversation_id.to_string(),
                peer_id: sender.to_string(),
            });
        }
        let own = sender_id == Some(self.current_user_id.as_str());
        let focused = self.focused.as_deref() == Some(conversation_id);
        if !own && !focused {
            self.unread.increment(conversation_id, now);
            changed = true;
        }
        self.ensure_eviction_armed(conversation_id);
        if changed {
            self.emit_conversation(conversation_id);
        }
    }

    fn message_read(&mut self, conversation_id: &str, peer_id: &str) {
        if peer_id != self.current_user_id {
            tracing::trace!(conversation_id, peer_id, "peer read receipt");
            return;
        }
        // Read on another device.
        if self.unread.mark_read(conversation_id) {
            self.emit_conversation(conversation_id);
        }
    }

    fn unread_snapshot(&mut self, conversation_id: &str, count: u32, as_of: u64) {
        match self.unread.reconcile(conversation_id, count, as_of) {
            ReconcileOutcome::Applied { changed: true } => {
                self.emit_conversation(conversation_id)
            }
            ReconcileOutcome::Applied { changed: false } => {}
            ReconcileOutcome::Stale => {
                tracing::debug!(conversation_id, as_of, "ignoring stale presence-snapshot")
            }
        }
        self.ensure_eviction_armed(conversation_id);
    }
}
