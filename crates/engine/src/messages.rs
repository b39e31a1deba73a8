use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use shared::{
    domain::{CorrelationId, GroupId, MessageId, MessageKind, SendTarget, UserId},
    error::SyncError,
    protocol::ServerFrame,
};
use store::{NewMessage, Store};

use crate::{gate::RelationshipGate, groups::GroupRouter, registry::ConnectionRegistry};

/// Accepts a send, persists it, fans it out, and reconciles the sender's
/// optimistic copy via the `saved` event. Receipts (`delivered`, `read`)
/// are emitted strictly after the `saved`/`received` frames of the same
/// message, so per-session FIFO channels preserve the required order.
pub struct MessageSynchronizer {
    registry: Arc<ConnectionRegistry>,
    groups: Arc<GroupRouter>,
    gate: RelationshipGate,
    store: Store,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender_id: UserId,
    pub target: SendTarget,
    pub body: String,
    pub kind: MessageKind,
    pub correlation_id: CorrelationId,
    pub reply_to: Option<MessageId>,
}

impl MessageSynchronizer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        groups: Arc<GroupRouter>,
        gate: RelationshipGate,
        store: Store,
    ) -> Self {
        Self {
            registry,
            groups,
            gate,
            store,
        }
    }

    pub async fn send(&self, request: SendRequest) -> Result<MessageId, SyncError> {
        match request.target {
            SendTarget::User { user_id } => self.send_direct(request, user_id).await,
            SendTarget::Group { group_id } => self.send_group(request, group_id).await,
        }
    }

    async fn send_direct(
        &self,
        request: SendRequest,
        recipient: UserId,
    ) -> Result<MessageId, SyncError> {
        // gate before anything is persisted; a refusal reaches only the
        // sender's own sessions
        self.gate.check(request.sender_id, recipient).await?;
        if !self.store.user_exists(recipient).await? {
            return Err(SyncError::NotFound(format!("user {}", recipient.0)));
        }

        let stored = self.store.insert_message(&new_message(&request)).await?;
        let message_id = stored.message_id;
        let payload = stored.into_payload();

        // first direct exchange establishes presence interest both ways
        self.store
            .add_contact(request.sender_id, recipient)
            .await?;

        self.registry.send_to_user(
            request.sender_id,
            &ServerFrame::Saved {
                correlation_id: payload.correlation_id,
                server_id: message_id,
                message: payload.clone(),
            },
        );
        self.registry
            .send_to_user(recipient, &ServerFrame::Received { message: payload });

        if self.registry.is_online(recipient) {
            let delivered_at = Utc::now();
            if self.store.mark_delivered(message_id, delivered_at).await? {
                self.registry.send_to_user(
                    request.sender_id,
                    &ServerFrame::Delivered {
                        message_id,
                        delivered_at,
                    },
                );
            }
        }

        debug!(
            sender = request.sender_id.0,
            recipient = recipient.0,
            message = message_id.0,
            "direct message synchronized"
        );
        Ok(message_id)
    }

    async fn send_group(
        &self,
        request: SendRequest,
        group_id: GroupId,
    ) -> Result<MessageId, SyncError> {
        self.groups.ensure_live(group_id)?;
        let members = self.groups.members(group_id).await?;
        if !members.contains(&request.sender_id) {
            return Err(SyncError::NotFound(format!(
                "group {} membership",
                group_id.0
            )));
        }
        // the sender's standing relative to the group is its owner's
        // block relation
        let summary = self.groups.summary(group_id).await?;
        if summary.owner_id != request.sender_id {
            self.gate.check(request.sender_id, summary.owner_id).await?;
        }

        let stored = self.store.insert_message(&new_message(&request)).await?;
        let message_id = stored.message_id;
        let payload = stored.into_payload();

        self.registry.send_to_user(
            request.sender_id,
            &ServerFrame::Saved {
                correlation_id: payload.correlation_id,
                server_id: message_id,
                message: payload.clone(),
            },
        );
        // per-member gate: a block between the sender and a member drops
        // that member's copy silently, without notice to either side
        let frame = ServerFrame::Received { message: payload };
        let mut reached = 0;
        for member in members {
            if member == request.sender_id {
                continue;
            }
            if self.gate.is_blocked(request.sender_id, member).await? {
                continue;
            }
            reached += self.registry.send_to_user(member, &frame);
        }

        debug!(
            sender = request.sender_id.0,
            group = group_id.0,
            message = message_id.0,
            reached,
            "group message synchronized"
        );
        Ok(message_id)
    }

    /// Stamp read receipts up to `upto` and tell the original sender. The
    /// engine trusts the client's claim that the conversation is open; it
    /// keeps no authoritative open-chat state of its own.
    pub async fn mark_read(
        &self,
        reader_id: UserId,
        other_id: UserId,
        upto: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let affected = self
            .store
            .mark_read_direct(reader_id, other_id, upto, Utc::now())
            .await?;
        if affected > 0 {
            self.registry.send_to_user(
                other_id,
                &ServerFrame::Read {
                    reader_id,
                    upto,
                },
            );
        }
        Ok(())
    }

    /// Fan out a delete to everyone who saw the message. The authoritative
    /// row removal belongs to the CRUD layer; this only converges sessions.
    pub async fn delete(
        &self,
        requester_id: UserId,
        message_id: MessageId,
    ) -> Result<(), SyncError> {
        let message = self
            .store
            .load_message(message_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {}", message_id.0)))?;
        if message.sender_id != requester_id {
            return Err(SyncError::NotFound(format!(
                "message {} for user {}",
                message_id.0, requester_id.0
            )));
        }

        let frame = ServerFrame::MessageDeleted { message_id };
        match message.target {
            SendTarget::User { user_id } => {
                self.registry.send_to_user(requester_id, &frame);
                self.registry.send_to_user(user_id, &frame);
            }
            SendTarget::Group { group_id } => {
                self.registry.send_to_user(requester_id, &frame);
                self.groups
                    .fanout(group_id, &frame, Some(requester_id))
                    .await?;
            }
        }
        Ok(())
    }
}

fn new_message(request: &SendRequest) -> NewMessage {
    NewMessage {
        sender_id: request.sender_id,
        target: request.target,
        body: request.body.clone(),
        kind: request.kind,
        correlation_id: request.correlation_id,
        reply_to_id: request.reply_to,
        forwarded: false,
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
