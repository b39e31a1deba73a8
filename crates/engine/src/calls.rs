use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, info};

use shared::{
    domain::{CallId, MediaKind, UserId},
    error::SyncError,
    protocol::{CallEndReason, ServerFrame},
};
use store::Store;

use crate::{gate::RelationshipGate, registry::ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Accepted,
    Active,
}

#[derive(Debug, Clone)]
struct CallSession {
    caller_id: UserId,
    callee_id: UserId,
    media_kind: MediaKind,
    state: CallState,
}

/// Live calls only. An entry is removed the moment its call reaches a
/// terminal state, so the table stays proportional to concurrent calls.
/// Ids are handed out sequentially, which lets `lookup` tell an ended
/// call (Stale) apart from one that never existed (NotFound).
#[derive(Default)]
struct CallTable {
    next_id: i64,
    sessions: HashMap<CallId, CallSession>,
}

impl CallTable {
    fn lookup(&mut self, call_id: CallId) -> Result<&mut CallSession, SyncError> {
        let was_allocated = call_id.0 >= 1 && call_id.0 <= self.next_id;
        match self.sessions.get_mut(&call_id) {
            Some(session) => Ok(session),
            None if was_allocated => Err(SyncError::Stale(format!("call {}", call_id.0))),
            None => Err(SyncError::NotFound(format!("call {}", call_id.0))),
        }
    }
}

/// Relays call-negotiation payloads between exactly two identities and owns
/// the call lifecycle. Payloads are opaque: the coordinator routes typed
/// envelopes and never reads their contents.
pub struct CallCoordinator {
    registry: Arc<ConnectionRegistry>,
    gate: RelationshipGate,
    store: Store,
    ring_timeout: Duration,
    table: Mutex<CallTable>,
}

impl CallCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gate: RelationshipGate,
        store: Store,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            store,
            ring_timeout,
            table: Mutex::new(CallTable::default()),
        }
    }

    pub fn live_call_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .len()
    }

    pub fn state_of(&self, call_id: CallId) -> Option<CallState> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .get(&call_id)
            .map(|session| session.state)
    }

    pub async fn place_call(
        self: &Arc<Self>,
        caller_id: UserId,
        callee_id: UserId,
        media_kind: MediaKind,
        offer: serde_json::Value,
    ) -> Result<CallId, SyncError> {
        // refusal is a one-way notice to the caller; the callee never learns
        self.gate.check(caller_id, callee_id).await?;
        if !self.store.user_exists(callee_id).await? {
            return Err(SyncError::NotFound(format!("user {}", callee_id.0)));
        }

        let call_id = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let busy = table
                .sessions
                .values()
                .any(|session| session.caller_id == caller_id && session.callee_id == callee_id);
            if busy {
                return Err(SyncError::Busy);
            }
            table.next_id += 1;
            let call_id = CallId(table.next_id);
            table.sessions.insert(
                call_id,
                CallSession {
                    caller_id,
                    callee_id,
                    media_kind,
                    state: CallState::Ringing,
                },
            );
            call_id
        };

        self.registry.send_to_user(
            callee_id,
            &ServerFrame::IncomingCall {
                call_id,
                caller_id,
                media_kind,
                offer,
            },
        );
        info!(call = call_id.0, caller = caller_id.0, callee = callee_id.0, "call ringing");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.ring_timeout).await;
            this.ring_expired(call_id);
        });

        Ok(call_id)
    }

    /// Ring timer. Fires only while the call is still `Ringing`; an answer
    /// or hang-up in the meantime leaves it a no-op.
    fn ring_expired(&self, call_id: CallId) {
        let caller_id = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(session) = table.sessions.get(&call_id) else {
                return;
            };
            if session.state != CallState::Ringing {
                return;
            }
            let caller_id = session.caller_id;
            table.sessions.remove(&call_id);
            caller_id
        };
        debug!(call = call_id.0, "ring timed out");
        // the caller alone is told, symmetrically to a decline
        self.registry.send_to_user(
            caller_id,
            &ServerFrame::CallEnded {
                call_id,
                reason: CallEndReason::TimedOut,
            },
        );
    }

    pub fn answer(
        &self,
        answerer_id: UserId,
        call_id: CallId,
        answer: serde_json::Value,
    ) -> Result<(), SyncError> {
        let caller_id = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let session = table.lookup(call_id)?;
            if session.callee_id != answerer_id {
                return Err(SyncError::NotFound(format!(
                    "call {} for user {}",
                    call_id.0, answerer_id.0
                )));
            }
            if session.state != CallState::Ringing {
                return Err(SyncError::Stale(format!("call {}", call_id.0)));
            }
            session.state = CallState::Accepted;
            session.caller_id
        };
        info!(call = call_id.0, "call accepted");
        self.registry
            .send_to_user(caller_id, &ServerFrame::CallAccepted { call_id, answer });
        Ok(())
    }

    /// Relay a connectivity-candidate envelope to the other party. Valid
    /// only once the call is accepted; the first relay marks it active.
    pub fn relay_candidate(
        &self,
        from_id: UserId,
        call_id: CallId,
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        let other = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let session = table.lookup(call_id)?;
            if !matches!(session.state, CallState::Accepted | CallState::Active) {
                return Err(SyncError::Stale(format!("call {}", call_id.0)));
            }
            let other = if session.caller_id == from_id {
                session.callee_id
            } else if session.callee_id == from_id {
                session.caller_id
            } else {
                return Err(SyncError::NotFound(format!(
                    "call {} for user {}",
                    call_id.0, from_id.0
                )));
            };
            session.state = CallState::Active;
            other
        };
        self.registry
            .send_to_user(other, &ServerFrame::Candidate { call_id, payload });
        Ok(())
    }

    /// End a live call. A callee hanging up while it still rings is a
    /// decline; every other case is a plain hang-up told to both parties'
    /// sessions so a second open tab clears its in-call state. Ending an
    /// already-ended call answers Stale.
    pub fn end(&self, by_id: UserId, call_id: CallId) -> Result<(), SyncError> {
        let (caller_id, callee_id, reason) = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let session = table.lookup(call_id)?;
            if session.caller_id != by_id && session.callee_id != by_id {
                return Err(SyncError::NotFound(format!(
                    "call {} for user {}",
                    call_id.0, by_id.0
                )));
            }
            let declined = session.state == CallState::Ringing && session.callee_id == by_id;
            let reason = if declined {
                CallEndReason::Declined
            } else {
                CallEndReason::HungUp
            };
            let parties = (session.caller_id, session.callee_id, reason);
            table.sessions.remove(&call_id);
            parties
        };
        info!(call = call_id.0, ?reason, "call ended");
        let frame = ServerFrame::CallEnded { call_id, reason };
        self.registry.send_to_user(caller_id, &frame);
        self.registry.send_to_user(callee_id, &frame);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
