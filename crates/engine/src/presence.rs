use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use shared::{domain::UserId, error::SyncError, protocol::ServerFrame};
use store::Store;

use crate::registry::ConnectionRegistry;

/// Presence snapshot for one identity. `is_online` is always derived from
/// the registry's live session count, never stored independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    store: Store,
    last_seen: Mutex<HashMap<UserId, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Store) -> Self {
        Self {
            registry,
            store,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Fired by the registry's first-session transition. Announces `online`
    /// to every contact of `identity`, never to the identity itself.
    pub async fn went_online(&self, identity: UserId) -> Result<(), SyncError> {
        let contacts = self.store.contacts_of(identity).await?;
        info!(user_id = identity.0, contacts = contacts.len(), "identity online");
        let frame = ServerFrame::Online { user_id: identity };
        for peer in contacts {
            self.registry.send_to_user(peer, &frame);
        }
        Ok(())
    }

    /// Fired by the registry's last-session transition. Stamps last-seen,
    /// writes it through for cold-start reads, and announces `offline`.
    pub async fn went_offline(&self, identity: UserId) -> Result<(), SyncError> {
        let now = Utc::now();
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity, now);
        if let Err(error) = self.store.update_last_seen(identity, now).await {
            warn!(user_id = identity.0, %error, "failed to persist last-seen stamp");
        }
        let contacts = self.store.contacts_of(identity).await?;
        info!(user_id = identity.0, "identity offline");
        let frame = ServerFrame::Offline {
            user_id: identity,
            last_seen: now,
        };
        for peer in contacts {
            self.registry.send_to_user(peer, &frame);
        }
        Ok(())
    }

    pub async fn snapshot(&self, identity: UserId) -> Result<PresenceRecord, SyncError> {
        let is_online = self.registry.is_online(identity);
        let cached = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&identity)
            .copied();
        let last_seen = match cached {
            Some(at) => Some(at),
            None => self.store.last_seen(identity).await?,
        };
        Ok(PresenceRecord {
            user_id: identity,
            is_online,
            last_seen,
        })
    }
}
