mod actions;
mod core;
mod error;
pub mod logging;
mod state;
mod updates;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::Sender;

pub use actions::AppAction;
pub use crate::core::{
    load_app_config, AppConfig, Backend, BackoffPolicy, ConnectionHandle, Connector, EventSink,
    HttpBackend, SocketTimeouts, TransportEvents, UnreadEntry, UnreadSnapshot, WireEvent,
    WsConnector,
};
pub use crate::core::router;
pub use error::PresenceError;
pub use state::*;

use updates::{CoreMsg, Notification};

/// Receives a fresh [`ConversationView`] whenever a subscribed conversation changes.
///
/// Callbacks run on a dedicated notifier thread; they must not block for long.
pub trait ConversationObserver: Send + Sync + 'static {
    fn on_change(&self, view: ConversationView);
}

/// External collaborators the core talks to. Tests swap these for fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Option<Arc<dyn Connector>>,
    pub backend: Option<Arc<dyn Backend>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn from_config(config: &AppConfig) -> Self {
        let connector = config
            .socket_url()
            .map(|url| {
                Arc::new(WsConnector::with_timeouts(url, config.socket_timeouts()))
                    as Arc<dyn Connector>
            });
        let backend = config
            .api_base_url()
            .map(|url| Arc::new(HttpBackend::new(url)) as Arc<dyn Backend>);
        Self {
            connector,
            backend,
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct HuddleApp {
    core_tx: Sender<CoreMsg>,
    shared_state: Arc<RwLock<PresenceState>>,
    next_subscription_id: AtomicU64,
}

impl HuddleApp {
    /// Builds the layer from `<data_dir>/huddle_config.json` and the environment.
    pub fn new(data_dir: &str, current_user_id: impl Into<String>) -> Arc<Self> {
        logging::init_logging();
        let config = load_app_config(data_dir);
        tracing::info!(data_dir, network = !config.network_disabled(), "HuddleApp::new() starting");
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, current_user_id, collaborators)
    }

    pub fn with_collaborators(
        config: AppConfig,
        current_user_id: impl Into<String>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let current_user_id = current_user_id.into();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let (notify_tx, notify_rx) = flume::unbounded::<Notification>();
        let shared_state = Arc::new(RwLock::new(PresenceState::empty()));

        // Actor loop thread (single threaded "presence actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                config,
                current_user_id,
                collaborators,
                core_tx_for_core,
                notify_tx,
                shared_for_core,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
                if core.is_shut_down() {
                    break;
                }
            }
        });

        // Observer callbacks run here so a slow view never stalls event processing.
        thread::spawn(move || {
            while let Ok(notification) = notify_rx.recv() {
                notification.deliver();
            }
        });

        Arc::new(Self {
            core_tx,
            shared_state,
            next_subscription_id: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> PresenceState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    /// Registers `observer` for `conversation_id`. The actor only holds a weak
    /// reference; the returned [`Subscription`] owns the observer, so delivery
    /// lasts exactly as long as the handle.
    pub fn subscribe(
        &self,
        conversation_id: impl Into<String>,
        observer: Arc<dyn ConversationObserver>,
    ) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let conversation_id = conversation_id.into();
        let _ = self.core_tx.send(CoreMsg::Subscribe {
            id,
            conversation_id: conversation_id.clone(),
            observer: Arc::downgrade(&observer),
        });
        Subscription {
            id,
            conversation_id,
            core_tx: self.core_tx.clone(),
            active: true,
            _observer: observer,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    pub fn is_typing(&self, conversation_id: &str, peer_id: &str) -> bool {
        self.state()
            .conversation(conversation_id)
            .map(|view| view.is_typing(peer_id))
            .unwrap_or(false)
    }

    pub fn typing_peers(&self, conversation_id: &str) -> Vec<String> {
        self.state()
            .conversation(conversation_id)
            .map(|view| view.typing_peers.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.state()
            .unread
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.dispatch(AppAction::Shutdown);
    }
}

impl Drop for HuddleApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Action(AppAction::Shutdown));
    }
}

/// Handle returned by [`HuddleApp::subscribe`]; unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    conversation_id: String,
    core_tx: Sender<CoreMsg>,
    active: bool,
    _observer: Arc<dyn ConversationObserver>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.core_tx.send(CoreMsg::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
