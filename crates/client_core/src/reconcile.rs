use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use shared::{
    domain::{CorrelationId, MessageId, MessageKind, UserId},
    protocol::MessagePayload,
};

/// How far along the server has acknowledged one of our messages. Ordered so
/// reconciliation can take the maximum and never walk a message backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryState {
    Pending,
    Saved,
    Delivered,
    Read,
}

/// One message as the local cache knows it. `server_id` is `None` only while
/// the send is still optimistic.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub server_id: Option<MessageId>,
    pub correlation_id: CorrelationId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl LocalMessage {
    fn from_payload(payload: &MessagePayload) -> Self {
        let state = if payload.read_at.is_some() {
            DeliveryState::Read
        } else if payload.delivered_at.is_some() {
            DeliveryState::Delivered
        } else {
            DeliveryState::Saved
        };
        Self {
            server_id: Some(payload.server_id),
            correlation_id: payload.correlation_id,
            sender_id: payload.sender_id,
            body: payload.body.clone(),
            kind: payload.kind,
            created_at: payload.created_at,
            state,
        }
    }
}

/// Per-conversation message cache. Acknowledged rows sort by server id, so
/// every replica converges to the same order; optimistic sends trail at the
/// end until the matching `saved` splices them in.
pub struct ConversationCache {
    me: UserId,
    acked: BTreeMap<MessageId, LocalMessage>,
    acked_by_correlation: HashMap<CorrelationId, MessageId>,
    pending: Vec<LocalMessage>,
}

impl ConversationCache {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            acked: BTreeMap::new(),
            acked_by_correlation: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn pending_position(&self, correlation_id: CorrelationId) -> Option<usize> {
        self.pending
            .iter()
            .position(|m| m.correlation_id == correlation_id)
    }

    /// Record a send the server has not acknowledged yet. Retrying the same
    /// correlation id never yields a second entry.
    pub fn insert_optimistic(
        &mut self,
        correlation_id: CorrelationId,
        body: String,
        kind: MessageKind,
    ) {
        if self.acked_by_correlation.contains_key(&correlation_id)
            || self.pending_position(correlation_id).is_some()
        {
            return;
        }
        self.pending.push(LocalMessage {
            server_id: None,
            correlation_id,
            sender_id: self.me,
            body,
            kind,
            created_at: Utc::now(),
            state: DeliveryState::Pending,
        });
    }

    /// Splice the server's acknowledgement over the optimistic entry.
    /// Replays are absorbed without duplicating the row.
    pub fn apply_saved(&mut self, payload: &MessagePayload) {
        if let Some(position) = self.pending_position(payload.correlation_id) {
            self.pending.remove(position);
        }
        self.upsert(LocalMessage::from_payload(payload));
    }

    /// A message from the other side. Duplicate server ids collapse into
    /// one row.
    pub fn apply_received(&mut self, payload: &MessagePayload) {
        self.upsert(LocalMessage::from_payload(payload));
    }

    pub fn apply_delivered(&mut self, message_id: MessageId) {
        if let Some(message) = self.acked.get_mut(&message_id) {
            message.state = message.state.max(DeliveryState::Delivered);
        }
    }

    /// A read receipt covers everything we sent up to `upto`. States only
    /// move forward; a late `delivered` after this is a no-op.
    pub fn apply_read(&mut self, reader_id: UserId, upto: DateTime<Utc>) {
        if reader_id == self.me {
            return;
        }
        for message in self.acked.values_mut() {
            if message.sender_id == self.me && message.created_at <= upto {
                message.state = message.state.max(DeliveryState::Read);
            }
        }
    }

    pub fn apply_deleted(&mut self, message_id: MessageId) {
        if let Some(removed) = self.acked.remove(&message_id) {
            self.acked_by_correlation.remove(&removed.correlation_id);
        }
    }

    /// Fold a history page into the cache. Server rows are authoritative for
    /// every acknowledged field; optimistic sends the page does not cover
    /// stay queued.
    pub fn merge_history(&mut self, page: &[MessagePayload]) {
        for payload in page {
            if let Some(position) = self.pending_position(payload.correlation_id) {
                self.pending.remove(position);
            }
            self.upsert(LocalMessage::from_payload(payload));
        }
    }

    fn upsert(&mut self, incoming: LocalMessage) {
        let Some(server_id) = incoming.server_id else {
            return;
        };
        match self.acked.get_mut(&server_id) {
            Some(existing) => {
                let state = existing.state.max(incoming.state);
                *existing = incoming;
                existing.state = state;
            }
            None => {
                self.acked_by_correlation
                    .insert(incoming.correlation_id, server_id);
                self.acked.insert(server_id, incoming);
            }
        }
    }

    /// Display order: acknowledged rows by server id, then unacknowledged
    /// sends in the order they were attempted.
    pub fn messages(&self) -> Vec<&LocalMessage> {
        self.acked.values().chain(self.pending.iter()).collect()
    }

    pub fn state_of(&self, correlation_id: CorrelationId) -> Option<DeliveryState> {
        if let Some(server_id) = self.acked_by_correlation.get(&correlation_id) {
            return self.acked.get(server_id).map(|m| m.state);
        }
        self.pending
            .iter()
            .find(|m| m.correlation_id == correlation_id)
            .map(|m| m.state)
    }

    pub fn len(&self) -> usize {
        self.acked.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acked.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
