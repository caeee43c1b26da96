// Connection lifecycle: connect, reconnect with backoff, degrade, shutdown.

use super::*;

impl AppCore {
    fn should_stay_connected(&self) -> bool {
        !self.shut_down && (self.connect_requested || self.subscriptions.total() > 0)
    }

    pub(super) fn connect(&mut self) {
        if self.connection.is_some() {
            return;
        }
        if self.connector.is_none() {
            tracing::debug!("no socket endpoint; staying offline");
            return;
        }
        if self.state.connection == ConnectionState::Unavailable {
            tracing::info!("presence unavailable; starting a fresh round of attempts");
            self.reconnect_backoff.reset();
        }
        self.timers.cancel(&TimerKey::Reconnect);
        self.open_connection();
    }

    fn open_connection(&mut self) {
        let Some(connector) = self.connector.clone() else {
            return;
        };
        self.generation = self.generation.wrapping_add(1);
        tracing::info!(
            generation = self.generation,
            attempt = self.reconnect_backoff.attempts(),
            "connecting"
        );
        let events = TransportEvents::new(self.generation, self.core_sender.clone());
        self.connection = Some(connector.connect(self.runtime.handle(), events));
        self.set_connection_state(ConnectionState::Connecting);
    }

    pub(super) fn handle_transport_opened(&mut self, generation: u64) {
        if generation != self.generation || self.connection.is_none() {
            return;
        }
        self.reconnect_backoff.reset();
        self.set_connection_state(ConnectionState::Connected);
        // Events sent while we were away are gone; ask for the authoritative counts.
        self.request_reconcile("connected");
        self.refetch_missing_members();
    }

    pub(super) fn handle_transport_closed(&mut self, generation: u64, reason: Option<String>) {
        if generation != self.generation {
            return;
        }
        self.connection = None;
        let err = PresenceError::TransportUnavailable(
            reason.unwrap_or_else(|| "closed".to_string()),
        );
        tracing::warn!(%err, generation, "socket closed");

        if !self.should_stay_connected() {
            self.set_connection_state(ConnectionState::Disconnected);
            return;
        }
        if let Some(max) = self.config.max_reconnect_attempts() {
            if self.reconnect_backoff.attempts() >= max {
                self.degrade();
                return;
            }
        }
        let delay = self.reconnect_backoff.next_delay();
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_backoff.attempts(),
            "reconnect scheduled"
        );
        self.timers.arm(TimerKey::Reconnect, delay);
        self.set_connection_state(ConnectionState::Disconnected);
    }

    pub(super) fn handle_reconnect_due(&mut self) {
        if self.connection.is_some() || !self.should_stay_connected() {
            return;
        }
        self.open_connection();
    }

    /// Retry budget exhausted: typing data is unknown from here on.
    fn degrade(&mut self) {
        tracing::warn!(
            attempts = self.reconnect_backoff.attempts(),
            "reconnect budget exhausted; presence unavailable"
        );
        self.typing.clear_all();
        self.timers
            .cancel_matching(|key| matches!(key, TimerKey::Typing { .. }));
        self.set_connection_state(ConnectionState::Unavailable);
    }

    pub(super) fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::info!("shutdown");
        self.shut_down = true;
        self.timers.cancel_all();
        // Dropping the handle aborts the socket task; the bump orphans anything it already queued.
        self.connection = None;
        self.generation = self.generation.wrapping_add(1);
        self.reconcile_token = self.reconcile_token.wrapping_add(1);
        self.reconcile_in_flight = false;
        self.reconcile_dirty = false;
        self.set_connection_state(ConnectionState::Disconnected);
    }

    pub(super) fn set_connection_state(&mut self, next: ConnectionState) {
        if self.state.connection == next {
            return;
        }
        tracing::info!(from = ?self.state.connection, to = ?next, "connection state");
        self.state.connection = next;
        // Every view carries the connection state.
        self.emit_all();
    }

    pub(super) fn send_wire(&mut self, event: WireEvent) {
        if self.state.connection != ConnectionState::Connected {
            tracing::debug!(tag = event.tag(), "offline; dropping outbound event");
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        if !connection.send(event.to_frame()) {
            tracing::debug!(tag = event.tag(), "socket task gone; dropping outbound event");
        }
    }
}
