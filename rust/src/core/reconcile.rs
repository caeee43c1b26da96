// Unread reconciliation and group membership lookups against the backend.

use std::collections::BTreeSet;

use super::*;

impl AppCore {
    pub(super) fn request_reconcile(&mut self, reason: &'static str) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        if self.reconcile_in_flight {
            self.reconcile_dirty = true;
            return;
        }
        self.timers.cancel(&TimerKey::ReconcileRetry);
        self.reconcile_in_flight = true;
        self.reconcile_dirty = false;
        self.reconcile_token = self.reconcile_token.wrapping_add(1);
        let token = self.reconcile_token;
        tracing::debug!(reason, token, "fetching unread snapshot");

        let fetch = backend.fetch_unread();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = fetch.await.map_err(|e| format!("{e:#}"));
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::UnreadSnapshotFetched { token, result },
            )));
        });
    }

    pub(super) fn handle_unread_snapshot_fetched(
        &mut self,
        token: u64,
        result: Result<UnreadSnapshot, String>,
    ) {
        // Ignore results that outlived a shutdown.
        if token != self.reconcile_token {
            return;
        }
        self.reconcile_in_flight = false;
        match result {
            Ok(snapshot) => {
                self.reconcile_backoff.reset();
                self.apply_unread_snapshot(&snapshot);
                if std::mem::take(&mut self.reconcile_dirty) {
                    self.request_reconcile("coalesced");
                }
            }
            Err(e) => {
                let err = PresenceError::ReconciliationFailure(e);
                let delay = self.reconcile_backoff.next_delay();
                tracing::warn!(%err, retry_in_ms = delay.as_millis() as u64, "keeping local counts");
                // The retry subsumes any trigger that arrived meanwhile.
                self.reconcile_dirty = false;
                self.timers.arm(TimerKey::ReconcileRetry, delay);
            }
        }
    }

    fn apply_unread_snapshot(&mut self, snapshot: &UnreadSnapshot) {
        let tracked: BTreeSet<String> = self
            .unread
            .conversation_ids()
            .chain(self.subscriptions.conversation_ids())
            .cloned()
            .collect();

        let mut changed = 0usize;
        for conversation_id in &tracked {
            let count = snapshot.count_for(conversation_id).unwrap_or(0);
            match self.unread.reconcile(conversation_id, count, snapshot.as_of) {
                ReconcileOutcome::Applied { changed: true } => {
                    changed += 1;
                    self.refresh_conversation(conversation_id);
                }
                ReconcileOutcome::Applied { changed: false } => {}
                ReconcileOutcome::Stale => {
                    tracing::debug!(conversation_id = %conversation_id, as_of = snapshot.as_of, "snapshot older than last reconcile")
                }
            }
        }
        if changed > 0 {
            self.commit_state();
        }
        tracing::info!(
            as_of = snapshot.as_of,
            tracked = tracked.len(),
            changed,
            "unread reconciled"
        );
    }

    pub(super) fn ensure_reconcile_interval(&mut self) {
        if self.backend.is_none() || self.subscriptions.total() == 0 {
            return;
        }
        if !self.timers.is_armed(&TimerKey::ReconcileInterval) {
            self.timers
                .arm(TimerKey::ReconcileInterval, self.config.reconcile_interval());
        }
    }

    pub(super) fn ensure_members(&mut self, conversation_id: &str) {
        if self.members.contains_key(conversation_id)
            || self.members_in_flight.contains(conversation_id)
        {
            return;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        self.members_in_flight.insert(conversation_id.to_string());

        let fetch = backend.fetch_members(conversation_id);
        let tx = self.core_sender.clone();
        let conversation_id = conversation_id.to_string();
        self.runtime.spawn(async move {
            let result = fetch.await.map_err(|e| format!("{e:#}"));
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::MembersFetched {
                conversation_id,
                result,
            })));
        });
    }

    pub(super) fn refetch_missing_members(&mut self) {
        let missing: Vec<String> = self
            .subscriptions
            .conversation_ids()
            .filter(|id| !self.members.contains_key(*id))
            .cloned()
            .collect();
        for conversation_id in missing {
            self.ensure_members(&conversation_id);
        }
    }

    pub(super) fn handle_members_fetched(
        &mut self,
        conversation_id: String,
        result: Result<Vec<String>, String>,
    ) {
        self.members_in_flight.remove(&conversation_id);
        match result {
            Ok(members) => {
                if !self.subscriptions.is_subscribed(&conversation_id) {
                    return;
                }
                tracing::debug!(conversation_id = %conversation_id, members = members.len(), "members loaded");
                self.members
                    .insert(conversation_id.clone(), members.into_iter().collect());
                self.emit_conversation(&conversation_id);
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, %e, "member lookup failed; retrying on reconnect");
            }
        }
    }
}
