use chrono::{Duration, Utc};

use shared::{
    domain::{CorrelationId, MessageId, MessageKind, SendTarget, UserId},
    protocol::MessagePayload,
};

use super::{ConversationCache, DeliveryState};

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn payload(server_id: i64, correlation_id: CorrelationId, sender: UserId) -> MessagePayload {
    MessagePayload {
        server_id: MessageId(server_id),
        correlation_id,
        sender_id: sender,
        target: SendTarget::User {
            user_id: if sender == ME { PEER } else { ME },
        },
        body: format!("message {server_id}"),
        kind: MessageKind::Text,
        created_at: Utc::now(),
        delivered_at: None,
        read_at: None,
        edited_at: None,
        pinned: false,
        starred_by: Vec::new(),
        reply_to_id: None,
        forwarded: false,
    }
}

#[test]
fn saved_splices_the_optimistic_entry() {
    let mut cache = ConversationCache::new(ME);
    let correlation = CorrelationId::generate();
    cache.insert_optimistic(correlation, "hi".into(), MessageKind::Text);
    assert_eq!(cache.state_of(correlation), Some(DeliveryState::Pending));

    cache.apply_saved(&payload(10, correlation, ME));
    assert_eq!(cache.len(), 1, "exactly one entry per correlation id");
    assert_eq!(cache.state_of(correlation), Some(DeliveryState::Saved));

    // replayed acknowledgement changes nothing
    cache.apply_saved(&payload(10, correlation, ME));
    assert_eq!(cache.len(), 1);
}

#[test]
fn retried_send_never_duplicates_the_entry() {
    let mut cache = ConversationCache::new(ME);
    let correlation = CorrelationId::generate();
    cache.insert_optimistic(correlation, "hi".into(), MessageKind::Text);
    cache.insert_optimistic(correlation, "hi".into(), MessageKind::Text);
    assert_eq!(cache.len(), 1);

    cache.apply_saved(&payload(10, correlation, ME));
    cache.insert_optimistic(correlation, "hi".into(), MessageKind::Text);
    assert_eq!(cache.len(), 1, "ack must not resurrect the pending copy");
}

#[test]
fn failed_send_stays_pending() {
    let mut cache = ConversationCache::new(ME);
    let correlation = CorrelationId::generate();
    cache.insert_optimistic(correlation, "lost".into(), MessageKind::Text);

    // no ack ever arrives; the entry survives for retry
    assert_eq!(cache.state_of(correlation), Some(DeliveryState::Pending));
    let ordered = cache.messages();
    assert_eq!(ordered.len(), 1);
    assert!(ordered[0].server_id.is_none());
}

#[test]
fn receipts_only_move_state_forward() {
    let mut cache = ConversationCache::new(ME);
    let correlation = CorrelationId::generate();
    cache.apply_saved(&payload(10, correlation, ME));

    cache.apply_read(PEER, Utc::now() + Duration::seconds(1));
    assert_eq!(cache.state_of(correlation), Some(DeliveryState::Read));

    // a late delivered receipt must not walk the state back
    cache.apply_delivered(MessageId(10));
    assert_eq!(cache.state_of(correlation), Some(DeliveryState::Read));
}

#[test]
fn read_receipt_covers_only_own_messages_up_to_the_mark() {
    let mut cache = ConversationCache::new(ME);
    let mine = CorrelationId::generate();
    let theirs = CorrelationId::generate();
    let late = CorrelationId::generate();

    let mut early = payload(10, mine, ME);
    early.created_at = Utc::now() - Duration::seconds(60);
    cache.apply_saved(&early);
    cache.apply_received(&payload(11, theirs, PEER));
    let mut after = payload(12, late, ME);
    after.created_at = Utc::now() + Duration::seconds(60);
    cache.apply_saved(&after);

    cache.apply_read(PEER, Utc::now());
    assert_eq!(cache.state_of(mine), Some(DeliveryState::Read));
    assert_eq!(cache.state_of(late), Some(DeliveryState::Saved));
    assert_eq!(cache.state_of(theirs), Some(DeliveryState::Saved));
}

#[test]
fn merge_history_is_a_set_union_keyed_by_server_id() {
    let mut cache = ConversationCache::new(ME);
    let acked = CorrelationId::generate();
    let unacked = CorrelationId::generate();
    cache.apply_received(&payload(10, CorrelationId::generate(), PEER));
    cache.insert_optimistic(unacked, "draft".into(), MessageKind::Text);

    let mut page = vec![
        payload(10, CorrelationId::generate(), PEER),
        payload(11, acked, ME),
    ];
    page[1].delivered_at = Some(Utc::now());
    cache.merge_history(&page);

    // replayed page rows collapse; the draft survives at the tail
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.state_of(acked), Some(DeliveryState::Delivered));
    let ordered = cache.messages();
    assert_eq!(ordered.last().and_then(|m| m.server_id), None);

    cache.merge_history(&page);
    assert_eq!(cache.len(), 3, "history replay must not duplicate rows");
}

#[test]
fn deleted_messages_drop_out_of_the_snapshot() {
    let mut cache = ConversationCache::new(ME);
    let correlation = CorrelationId::generate();
    cache.apply_saved(&payload(10, correlation, ME));
    cache.apply_deleted(MessageId(10));
    assert!(cache.is_empty());
    assert_eq!(cache.state_of(correlation), None);
}
