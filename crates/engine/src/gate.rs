use shared::{domain::UserId, error::SyncError};
use store::Store;

/// Blocklist predicate consulted before any cross-identity delivery. Every
/// call reads the store: the relation can change between checks, so nothing
/// is cached here.
#[derive(Clone)]
pub struct RelationshipGate {
    store: Store,
}

impl RelationshipGate {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// True when either party blocks the other.
    pub async fn is_blocked(&self, a: UserId, b: UserId) -> Result<bool, SyncError> {
        Ok(self.store.is_blocked(a, b).await?)
    }

    pub async fn check(&self, a: UserId, b: UserId) -> Result<(), SyncError> {
        if self.is_blocked(a, b).await? {
            Err(SyncError::Blocked)
        } else {
            Ok(())
        }
    }
}
