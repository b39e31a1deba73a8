use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::warn;

use shared::{
    domain::{ConversationId, UserId},
    error::SyncError,
    protocol::ServerFrame,
};
use store::Store;

use crate::registry::ConnectionRegistry;

/// Ephemeral, debounced "is typing" state per conversation. Entries carry a
/// generation so a refresh invalidates the expiry task of the previous one;
/// a missed explicit stop self-heals when the last generation expires.
pub struct TypingBroadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Store,
    debounce: Duration,
    state: Mutex<HashMap<ConversationId, HashMap<UserId, u64>>>,
    generation: Mutex<u64>,
}

impl TypingBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Store, debounce: Duration) -> Self {
        Self {
            registry,
            store,
            debounce,
            state: Mutex::new(HashMap::new()),
            generation: Mutex::new(0),
        }
    }

    pub async fn set_typing(
        self: &Arc<Self>,
        conversation: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        if is_typing {
            let generation = self.refresh(conversation, user_id);
            self.broadcast(conversation, user_id, true).await?;

            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.debounce).await;
                if this.clear_if_stale(conversation, user_id, generation) {
                    if let Err(error) = this.broadcast(conversation, user_id, false).await {
                        warn!(user_id = user_id.0, %error, "typing expiry broadcast failed");
                    }
                }
            });
            Ok(())
        } else {
            if self.clear(conversation, user_id) {
                self.broadcast(conversation, user_id, false).await?;
            }
            Ok(())
        }
    }

    pub fn is_typing(&self, conversation: ConversationId, user_id: UserId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&conversation)
            .is_some_and(|typers| typers.contains_key(&user_id))
    }

    fn refresh(&self, conversation: ConversationId, user_id: UserId) -> u64 {
        let mut counter = self
            .generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counter += 1;
        let generation = *counter;
        drop(counter);

        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(conversation)
            .or_default()
            .insert(user_id, generation);
        generation
    }

    fn clear(&self, conversation: ConversationId, user_id: UserId) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(typers) = state.get_mut(&conversation) else {
            return false;
        };
        let removed = typers.remove(&user_id).is_some();
        if typers.is_empty() {
            state.remove(&conversation);
        }
        removed
    }

    /// Remove only if the entry still belongs to `generation`; a refresh in
    /// the meantime keeps the newer entry alive.
    fn clear_if_stale(
        &self,
        conversation: ConversationId,
        user_id: UserId,
        generation: u64,
    ) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(typers) = state.get_mut(&conversation) else {
            return false;
        };
        if typers.get(&user_id) != Some(&generation) {
            return false;
        }
        typers.remove(&user_id);
        if typers.is_empty() {
            state.remove(&conversation);
        }
        true
    }

    /// Deliver to every conversation participant except the typer. Lost
    /// frames are tolerated; typing carries no ordering guarantee.
    async fn broadcast(
        &self,
        conversation: ConversationId,
        typer: UserId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        let recipients: Vec<UserId> = match conversation {
            ConversationId::Direct { .. } => conversation
                .direct_peer(typer)
                .into_iter()
                .collect(),
            ConversationId::Group { group_id } => self
                .store
                .group_members(group_id)
                .await?
                .into_iter()
                .filter(|member| *member != typer)
                .collect(),
        };
        let frame = ServerFrame::Typing {
            conversation,
            user_id: typer,
            is_typing,
        };
        for recipient in recipients {
            self.registry.send_to_user(recipient, &frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const DEBOUNCE: Duration = Duration::from_secs(4);

    async fn setup() -> (Arc<ConnectionRegistry>, Arc<TypingBroadcaster>, Store) {
        let store = Store::new("sqlite::memory:").await.expect("db");
        let registry = Arc::new(ConnectionRegistry::new());
        let typing = Arc::new(TypingBroadcaster::new(
            Arc::clone(&registry),
            store.clone(),
            DEBOUNCE,
        ));
        (registry, typing, store)
    }

    fn expect_typing(frame: ServerFrame, user: UserId, is_typing: bool) {
        match frame {
            ServerFrame::Typing {
                user_id,
                is_typing: got,
                ..
            } => {
                assert_eq!(user_id, user);
                assert_eq!(got, is_typing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrefreshed_entry_expires_with_a_stop_broadcast() {
        let (registry, typing, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let conversation = ConversationId::direct(alice, bob);

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        registry.register(bob, bob_tx);
        // pause only after store setup: under a paused clock the sqlx pool's
        // acquire timeout auto-advances past the sqlite worker thread (F4)
        tokio::time::pause();

        typing
            .set_typing(conversation, alice, true)
            .await
            .expect("typing");
        expect_typing(bob_rx.try_recv().expect("start frame"), alice, true);
        assert!(typing.is_typing(conversation, alice));

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;

        expect_typing(bob_rx.try_recv().expect("stop frame"), alice, false);
        assert!(!typing.is_typing(conversation, alice));
    }

    #[tokio::test]
    async fn refresh_extends_the_window() {
        let (registry, typing, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let conversation = ConversationId::direct(alice, bob);

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        registry.register(bob, bob_tx);
        tokio::time::pause();

        typing
            .set_typing(conversation, alice, true)
            .await
            .expect("typing");
        tokio::time::sleep(DEBOUNCE / 2).await;
        typing
            .set_typing(conversation, alice, true)
            .await
            .expect("refresh");
        // the first generation's timer fires here but must not clear the entry
        tokio::time::sleep(DEBOUNCE / 2 + Duration::from_millis(10)).await;
        assert!(typing.is_typing(conversation, alice));

        tokio::time::sleep(DEBOUNCE).await;
        assert!(!typing.is_typing(conversation, alice));

        // two starts (initial + refresh) and exactly one stop
        expect_typing(bob_rx.try_recv().expect("frame"), alice, true);
        expect_typing(bob_rx.try_recv().expect("frame"), alice, true);
        expect_typing(bob_rx.try_recv().expect("frame"), alice, false);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn explicit_stop_broadcasts_once_and_disarms_expiry() {
        let (registry, typing, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let conversation = ConversationId::direct(alice, bob);

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        registry.register(bob, bob_tx);
        tokio::time::pause();

        typing
            .set_typing(conversation, alice, true)
            .await
            .expect("typing");
        typing
            .set_typing(conversation, alice, false)
            .await
            .expect("stop");
        tokio::time::sleep(DEBOUNCE * 2).await;

        expect_typing(bob_rx.try_recv().expect("frame"), alice, true);
        expect_typing(bob_rx.try_recv().expect("frame"), alice, false);
        assert!(bob_rx.try_recv().is_err());
    }

    // no paused clock: group recipients come from the store (see F4)
    #[tokio::test]
    async fn group_typing_excludes_the_typer() {
        let (registry, typing, store) = setup().await;
        let alice = store.create_user("alice").await.expect("user");
        let bob = store.create_user("bob").await.expect("user");
        let carol = store.create_user("carol").await.expect("user");
        let group = store
            .create_group("trio", alice, &[bob, carol])
            .await
            .expect("group");
        let conversation = ConversationId::group(group);

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel();
        registry.register(alice, alice_tx);
        registry.register(bob, bob_tx);
        registry.register(carol, carol_tx);

        typing
            .set_typing(conversation, alice, true)
            .await
            .expect("typing");

        expect_typing(bob_rx.try_recv().expect("frame"), alice, true);
        expect_typing(carol_rx.try_recv().expect("frame"), alice, true);
        assert!(alice_rx.try_recv().is_err());
    }
}
