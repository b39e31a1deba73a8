use std::{sync::Arc, time::Duration};

use tracing::{error, warn};

use shared::{
    domain::UserId,
    error::{Rejection, SyncError},
    protocol::{ClientFrame, ServerFrame},
};
use store::Store;

pub mod calls;
pub mod gate;
pub mod groups;
pub mod messages;
pub mod presence;
pub mod registry;
pub mod typing;

use calls::CallCoordinator;
use gate::RelationshipGate;
use groups::GroupRouter;
use messages::{MessageSynchronizer, SendRequest};
use presence::PresenceTracker;
use registry::{ConnectionRegistry, FrameSender, SessionGuard};
use typing::TypingBroadcaster;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub typing_debounce: Duration,
    pub ring_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            typing_debounce: Duration::from_secs(4),
            ring_timeout: Duration::from_secs(30),
        }
    }
}

/// The real-time synchronization engine. All components share one injected
/// registry; every piece of transient state (sessions, typing, calls) lives
/// here and is rebuilt from scratch on process restart.
pub struct SyncEngine {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingBroadcaster>,
    pub messages: Arc<MessageSynchronizer>,
    pub groups: Arc<GroupRouter>,
    pub calls: Arc<CallCoordinator>,
}

impl SyncEngine {
    pub fn new(store: Store, config: EngineConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let gate = RelationshipGate::new(store.clone());
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&registry), store.clone()));
        let typing = Arc::new(TypingBroadcaster::new(
            Arc::clone(&registry),
            store.clone(),
            config.typing_debounce,
        ));
        let groups = Arc::new(GroupRouter::new(Arc::clone(&registry), store.clone()));
        let messages = Arc::new(MessageSynchronizer::new(
            Arc::clone(&registry),
            Arc::clone(&groups),
            gate.clone(),
            store.clone(),
        ));
        let calls = Arc::new(CallCoordinator::new(
            Arc::clone(&registry),
            gate,
            store,
            config.ring_timeout,
        ));
        Arc::new(Self {
            registry,
            presence,
            typing,
            messages,
            groups,
            calls,
        })
    }

    /// Register a session channel. The returned guard unregisters on drop;
    /// the first/last session transitions drive the presence broadcasts.
    pub async fn attach(&self, identity: UserId, sender: FrameSender) -> SessionGuard {
        let (session_id, first) = self.registry.register(identity, sender);
        if first {
            if let Err(error) = self.presence.went_online(identity).await {
                warn!(user_id = identity.0, %error, "online broadcast failed");
            }
        }
        let presence = Arc::clone(&self.presence);
        SessionGuard::new(
            Arc::clone(&self.registry),
            identity,
            session_id,
            Box::new(move |id| {
                // guards drop on the socket task's exit path; the offline
                // broadcast must not block it
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(error) = presence.went_offline(id).await {
                            warn!(user_id = id.0, %error, "offline broadcast failed");
                        }
                    });
                }
            }),
        )
    }

    /// Route one inbound frame. Refusals with a wire code go back to the
    /// initiator's own sessions only; store failures are logged and
    /// absorbed so one bad request never tears down the session loop.
    pub async fn dispatch(&self, identity: UserId, frame: ClientFrame) {
        let (context, result) = match frame {
            ClientFrame::Register { .. } => {
                // registration is a transport concern, handled before attach
                ("register", Ok(()))
            }
            ClientFrame::Send {
                target,
                body,
                kind,
                correlation_id,
                reply_to,
            } => (
                "send",
                self.messages
                    .send(SendRequest {
                        sender_id: identity,
                        target,
                        body,
                        kind,
                        correlation_id,
                        reply_to,
                    })
                    .await
                    .map(|_| ()),
            ),
            ClientFrame::MarkRead { other_id, upto } => (
                "mark_read",
                self.messages.mark_read(identity, other_id, upto).await,
            ),
            ClientFrame::Typing {
                conversation,
                is_typing,
            } => (
                "typing",
                self.typing.set_typing(conversation, identity, is_typing).await,
            ),
            ClientFrame::PlaceCall {
                callee_id,
                media_kind,
                offer,
            } => (
                "place_call",
                self.calls
                    .place_call(identity, callee_id, media_kind, offer)
                    .await
                    .map(|_| ()),
            ),
            ClientFrame::AnswerCall { call_id, answer } => (
                "answer_call",
                self.calls.answer(identity, call_id, answer),
            ),
            ClientFrame::RelayCandidate { call_id, payload } => (
                "relay_candidate",
                self.calls.relay_candidate(identity, call_id, payload),
            ),
            ClientFrame::EndCall { call_id } => ("end_call", self.calls.end(identity, call_id)),
            ClientFrame::DeleteMessage { message_id } => (
                "delete_message",
                self.messages.delete(identity, message_id).await,
            ),
        };

        if let Err(err) = result {
            match err.reject_code() {
                Some(code) => {
                    self.registry.send_to_user(
                        identity,
                        &ServerFrame::Rejected(Rejection::new(code, context)),
                    );
                }
                None => match err {
                    SyncError::Store(error) => {
                        error!(user_id = identity.0, context, %error, "store failure")
                    }
                    other => warn!(user_id = identity.0, context, %other, "dropped operation"),
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
