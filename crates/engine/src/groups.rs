use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

use shared::{
    domain::{GroupId, UserId},
    error::SyncError,
    protocol::{GroupSummary, ServerFrame},
};
use store::Store;

use crate::registry::ConnectionRegistry;

/// Resolves a group id to its member roster and replicates events to every
/// online member's sessions. A deleted group is tombstoned: the terminal
/// `group_deleted` event is the last fan-out it will ever produce.
pub struct GroupRouter {
    registry: Arc<ConnectionRegistry>,
    store: Store,
    dead: Mutex<HashSet<GroupId>>,
}

impl GroupRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Store) -> Self {
        Self {
            registry,
            store,
            dead: Mutex::new(HashSet::new()),
        }
    }

    pub fn ensure_live(&self, group_id: GroupId) -> Result<(), SyncError> {
        let dead = self
            .dead
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dead.contains(&group_id) {
            Err(SyncError::Stale(format!("group {} is deleted", group_id.0)))
        } else {
            Ok(())
        }
    }

    /// Replicate `frame` to every member except `exclude`. Returns how many
    /// sessions it reached.
    pub async fn fanout(
        &self,
        group_id: GroupId,
        frame: &ServerFrame,
        exclude: Option<UserId>,
    ) -> Result<usize, SyncError> {
        self.ensure_live(group_id)?;
        let members = self.members(group_id).await?;
        let mut reached = 0;
        for member in members {
            if Some(member) == exclude {
                continue;
            }
            reached += self.registry.send_to_user(member, frame);
        }
        debug!(group_id = group_id.0, reached, "group fan-out");
        Ok(reached)
    }

    /// Membership lookup used by fan-out and by the synchronizer's group
    /// sends. Answers `NotFound` for ids the store has never seen.
    pub async fn members(&self, group_id: GroupId) -> Result<Vec<UserId>, SyncError> {
        let summary = self
            .store
            .group_summary(group_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("group {}", group_id.0)))?;
        if summary.deleted {
            return Err(SyncError::Stale(format!("group {} is deleted", group_id.0)));
        }
        Ok(summary.member_ids)
    }

    pub async fn summary(&self, group_id: GroupId) -> Result<GroupSummary, SyncError> {
        let stored = self
            .store
            .group_summary(group_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("group {}", group_id.0)))?;
        Ok(GroupSummary {
            group_id: stored.group_id,
            name: stored.name,
            owner_id: stored.owner_id,
            member_ids: stored.member_ids,
        })
    }

    /// Roster-change broadcasts travel the same fan-out path as messages so
    /// every member session converges without re-fetching.
    pub async fn notify_created(&self, group_id: GroupId) -> Result<(), SyncError> {
        let group = self.summary(group_id).await?;
        self.fanout(group_id, &ServerFrame::GroupCreated { group }, None)
            .await?;
        Ok(())
    }

    pub async fn notify_updated(&self, group_id: GroupId) -> Result<(), SyncError> {
        let group = self.summary(group_id).await?;
        self.fanout(group_id, &ServerFrame::GroupUpdated { group }, None)
            .await?;
        Ok(())
    }

    /// Emit the terminal `group_deleted` event, then drop all future
    /// fan-out for this id.
    pub async fn notify_deleted(&self, group_id: GroupId) -> Result<(), SyncError> {
        self.ensure_live(group_id)?;
        let members = self
            .store
            .group_summary(group_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("group {}", group_id.0)))?
            .member_ids;
        let frame = ServerFrame::GroupDeleted { group_id };
        for member in members {
            self.registry.send_to_user(member, &frame);
        }
        self.dead
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(group_id);
        info!(group_id = group_id.0, "group tombstoned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<ConnectionRegistry>, GroupRouter, Store) {
        let store = Store::new("sqlite::memory:").await.expect("db");
        let registry = Arc::new(ConnectionRegistry::new());
        let router = GroupRouter::new(Arc::clone(&registry), store.clone());
        (registry, router, store)
    }

    #[tokio::test]
    async fn fanout_excludes_sender_and_counts_online_sessions() {
        let (registry, router, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let carol = store.create_user("carol").await.expect("user");
        let dave = store.create_user("dave").await.expect("user");
        let group = store
            .create_group("quartet", alice, &[bob, carol, dave])
            .await
            .expect("group");

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel();
        registry.register(alice, alice_tx);
        registry.register(bob, bob_tx);
        registry.register(carol, carol_tx);
        // dave has no session

        let reached = router
            .fanout(group, &ServerFrame::GroupDeleted { group_id: group }, Some(alice))
            .await
            .expect("fanout");

        assert_eq!(reached, 2);
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_ok());
        assert!(carol_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn deleted_group_answers_stale_after_terminal_event() {
        let (registry, router, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let group = store.create_group("pair", alice, &[bob]).await.expect("group");

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        registry.register(bob, bob_tx);

        store.delete_group(group).await.expect("delete");
        router.notify_deleted(group).await.expect("notify");

        match bob_rx.try_recv().expect("frame") {
            ServerFrame::GroupDeleted { group_id } => assert_eq!(group_id, group),
            other => panic!("unexpected frame: {other:?}"),
        }

        let err = router
            .fanout(group, &ServerFrame::GroupDeleted { group_id: group }, None)
            .await
            .expect_err("tombstoned");
        assert!(matches!(err, SyncError::Stale(_)));
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let (_registry, router, _store) = setup().await;
        let err = router.members(GroupId(404)).await.expect_err("missing");
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
