use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use shared::{domain::UserId, protocol::ServerFrame};

pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

struct Session {
    sender: FrameSender,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    next_session: u64,
    sessions: HashMap<UserId, HashMap<SessionId, Session>>,
}

/// Binds identities to their live event channels. One identity may own any
/// number of simultaneous sessions (tabs, devices); registering a second
/// channel never evicts the first. The registry does no health-checking:
/// the transport layer unregisters a dead channel by dropping its guard.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new session id and whether it is the identity's first
    /// live session (the presence "went online" trigger).
    pub fn register(&self, identity: UserId, sender: FrameSender) -> (SessionId, bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.next_session += 1;
        let session_id = SessionId(inner.next_session);
        let sessions = inner.sessions.entry(identity).or_default();
        let first = sessions.is_empty();
        sessions.insert(
            session_id,
            Session {
                sender,
                connected_at: Utc::now(),
            },
        );
        debug!(user_id = identity.0, session = session_id.0, first, "session registered");
        (session_id, first)
    }

    /// Idempotent. Returns true when this removed the identity's last live
    /// session (the presence "went offline" trigger).
    pub fn unregister(&self, identity: UserId, session_id: SessionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sessions) = inner.sessions.get_mut(&identity) else {
            return false;
        };
        if sessions.remove(&session_id).is_none() {
            return false;
        }
        let last = sessions.is_empty();
        if last {
            inner.sessions.remove(&identity);
        }
        debug!(user_id = identity.0, session = session_id.0, last, "session unregistered");
        last
    }

    pub fn is_online(&self, identity: UserId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .sessions
            .get(&identity)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    pub fn session_count(&self, identity: UserId) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.sessions.get(&identity).map_or(0, HashMap::len)
    }

    pub fn connected_at(&self, identity: UserId, session_id: SessionId) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .sessions
            .get(&identity)?
            .get(&session_id)
            .map(|session| session.connected_at)
    }

    /// Replicate a frame to every live session of `identity`. Channels whose
    /// receiver is gone are skipped; their guards clean them up. Returns the
    /// number of sessions the frame reached.
    pub fn send_to_user(&self, identity: UserId, frame: &ServerFrame) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sessions) = inner.sessions.get(&identity) else {
            return 0;
        };
        sessions
            .values()
            .filter(|session| session.sender.send(frame.clone()).is_ok())
            .count()
    }
}

/// RAII handle for one registered session. Dropping it unregisters the
/// session on every exit path and, when it was the identity's last, runs the
/// offline callback on the runtime.
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    identity: UserId,
    session_id: SessionId,
    on_last_drop: Option<Box<dyn FnOnce(UserId) + Send>>,
}

impl SessionGuard {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry>,
        identity: UserId,
        session_id: SessionId,
        on_last_drop: Box<dyn FnOnce(UserId) + Send>,
    ) -> Self {
        Self {
            registry,
            identity,
            session_id,
            on_last_drop: Some(on_last_drop),
        }
    }

    pub fn identity(&self) -> UserId {
        self.identity
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let last = self.registry.unregister(self.identity, self.session_id);
        if last {
            if let Some(callback) = self.on_last_drop.take() {
                callback(self.identity);
            }
        }
    }
}
