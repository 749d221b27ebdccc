use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::{MessageReader, NodeState, QueueBuffer, QueueHandler};
use crate::broker::Message;
use crate::persistence::{SharedMessageStore, StoredMessage};
use crate::tests::support::{RecordingConsumer, RecordingDao, RecordingReader, message, persistent, settings};
use crate::transaction::Xid;
use crate::utils::BrokerError;

fn transient(id: u64) -> Message {
    message(id, "q", false, "transient")
}

fn backed_buffer(limit: usize) -> (Arc<QueueBuffer>, Arc<RecordingReader>) {
    let reader = RecordingReader::new();
    let dyn_reader: Arc<dyn MessageReader> = reader.clone();
    (QueueBuffer::new("q", limit, 0, Some(dyn_reader)), reader)
}

fn stored(message: &Message) -> StoredMessage {
    StoredMessage::from_message(message, BTreeSet::from(["q".to_string()]))
}

#[test]
fn test_buffer_add_and_remove_track_size() {
    let buffer = QueueBuffer::in_memory("q", 100);
    for id in 1..=5 {
        assert!(buffer.add_indelible(transient(id)));
    }
    assert_eq!(buffer.size(), 5);

    assert!(buffer.remove(2));
    assert!(buffer.remove(5));
    assert_eq!(buffer.size(), 3);
    assert_eq!(buffer.ids(), vec![1, 3, 4]);
}

#[test]
fn test_remove_unknown_id_is_ignored() {
    let buffer = QueueBuffer::in_memory("q", 10);
    buffer.add_indelible(transient(1));
    assert!(!buffer.remove(99));
    assert_eq!(buffer.size(), 1);
}

#[test]
fn test_first_deliverable_stays_in_buffer() {
    let buffer = QueueBuffer::in_memory("q", 10);
    buffer.add_indelible(transient(1));
    buffer.add_indelible(transient(2));

    let first = buffer.get_first_deliverable().unwrap();
    assert_eq!(first.internal_id(), 1);
    assert_eq!(buffer.size(), 2);
    assert_eq!(buffer.in_flight(), 1);
    assert_eq!(buffer.undelivered(), 1);

    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 2);
    assert!(buffer.get_first_deliverable().is_none());

    buffer.remove(1);
    assert_eq!(buffer.in_flight(), 1);
    assert_eq!(buffer.size(), 1);
}

#[test]
fn test_removing_undelivered_head_moves_cursor() {
    let buffer = QueueBuffer::in_memory("q", 10);
    for id in 1..=3 {
        buffer.add_indelible(transient(id));
    }
    buffer.remove(1);
    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 2);
}

#[test]
fn test_indelible_limit() {
    let buffer = QueueBuffer::in_memory("q", 2);
    assert!(buffer.add_indelible(transient(1)));
    assert!(buffer.add_indelible(transient(2)));
    assert!(!buffer.add_indelible(transient(3)));
    assert_eq!(buffer.size(), 2);
    assert_eq!(buffer.state_of(1), Some(NodeState::Indelible));
}

#[test]
fn test_cache_limit_leaves_tail_bare() {
    let (buffer, reader) = backed_buffer(2);
    let messages: Vec<_> = (1..=3).map(|id| persistent(id, "body")).collect();
    for message in &messages {
        buffer.add(message.clone());
    }

    assert_eq!(buffer.state_of(1), Some(NodeState::Full));
    assert_eq!(buffer.state_of(2), Some(NodeState::Full));
    assert_eq!(buffer.state_of(3), Some(NodeState::Bare));

    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 1);
    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 2);
    assert!(buffer.get_first_deliverable().is_none());
    assert!(reader.requested().is_empty());

    buffer.remove(1);
    assert_eq!(reader.requested(), vec![3]);
    assert_eq!(buffer.state_of(3), Some(NodeState::SubmittedForFilling));

    buffer.mark_filled(3, stored(&messages[2]));
    assert_eq!(buffer.state_of(3), Some(NodeState::Full));
    let third = buffer.get_first_deliverable().unwrap();
    assert_eq!(third.internal_id(), 3);
    assert!(Arc::ptr_eq(third.detachable(), messages[2].detachable()));
}

#[test]
fn test_adds_behind_bare_node_stay_bare() {
    let (buffer, _reader) = backed_buffer(10);
    let first = persistent(1, "a");
    buffer.add(first);
    buffer.add_bare(&persistent(2, "b"));
    buffer.add(persistent(3, "c"));

    assert_eq!(buffer.state_of(1), Some(NodeState::Full));
    assert_eq!(buffer.state_of(3), Some(NodeState::Bare));
    assert_eq!(buffer.ids(), vec![1, 2, 3]);
}

#[test]
fn test_delivery_waits_for_fill_in_order() {
    let (buffer, reader) = backed_buffer(5);
    let bare = persistent(1, "bare");
    buffer.add_bare(&bare);
    buffer.add(persistent(2, "behind"));

    assert!(buffer.get_first_deliverable().is_none());
    assert_eq!(reader.requested(), vec![1, 2]);

    buffer.mark_filled(2, stored(&persistent(2, "behind")));
    assert!(buffer.get_first_deliverable().is_none());

    buffer.mark_filled(1, stored(&bare));
    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 1);
    assert_eq!(buffer.get_first_deliverable().unwrap().internal_id(), 2);
}

#[test]
fn test_failed_fill_is_retried() {
    let (buffer, reader) = backed_buffer(1);
    buffer.add_bare(&persistent(1, "x"));

    assert!(buffer.get_first_deliverable().is_none());
    buffer.mark_fill_failed(1);
    assert_eq!(buffer.state_of(1), Some(NodeState::Bare));

    assert!(buffer.get_first_deliverable().is_none());
    assert_eq!(reader.requested(), vec![1, 1]);
}

#[test]
fn test_clear_returns_everything_in_order() {
    let buffer = QueueBuffer::in_memory("q", 10);
    for id in 1..=3 {
        buffer.add_indelible(transient(id));
    }
    let removed: Vec<u64> = buffer.clear().iter().map(|m| m.internal_id()).collect();
    assert_eq!(removed, vec![1, 2, 3]);
    assert!(buffer.is_empty());
    assert!(buffer.get_first_deliverable().is_none());
}

#[test]
fn test_in_memory_handler_full() {
    let mut config = settings();
    config.broker.non_durable_queue_max_depth = 1;
    let handler = QueueHandler::in_memory("q", &config.broker);

    handler.enqueue(transient(1)).unwrap();
    assert!(matches!(
        handler.enqueue(transient(2)),
        Err(BrokerError::QueueFull(name)) if name == "q"
    ));
}

#[test]
fn test_requeued_message_comes_first() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    handler.enqueue(transient(1)).unwrap();
    handler.enqueue(transient(2)).unwrap();

    let first = handler.take_for_delivery().unwrap();
    handler.requeue(first);

    let again = handler.take_for_delivery().unwrap();
    assert_eq!(again.internal_id(), 1);
    assert!(again.is_redelivered());
    assert_eq!(handler.take_for_delivery().unwrap().internal_id(), 2);
}

#[test]
fn test_transactional_enqueue_hidden_until_commit() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    let xid = Xid::new(1, "g", "b");

    handler.prepare_enqueue(&xid, transient(1)).unwrap();
    assert!(handler.has_pending(&xid));
    assert!(handler.take_for_delivery().is_none());

    handler.commit(&xid);
    assert!(!handler.has_pending(&xid));
    assert_eq!(handler.take_for_delivery().unwrap().internal_id(), 1);
}

#[test]
fn test_transactional_dequeue_rolled_back_keeps_message() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    let xid = Xid::new(1, "g", "b");
    let kept = transient(1);
    handler.enqueue(kept.clone()).unwrap();

    handler
        .prepare_detach(&xid, kept.detachable().clone())
        .unwrap();
    handler.rollback(&xid);
    assert_eq!(handler.buffer().size(), 1);

    handler
        .prepare_detach(&xid, kept.detachable().clone())
        .unwrap();
    handler.commit(&xid);
    assert!(handler.buffer().is_empty());
}

#[test]
fn test_durable_handler_persists_and_detaches() {
    let dao = RecordingDao::new();
    let store = Arc::new(SharedMessageStore::new(dao.clone(), &settings().store).unwrap());
    let handler = QueueHandler::durable("q", store.clone(), &settings().broker).unwrap();
    assert!(handler.is_durable());

    let message = persistent(1, "kept");
    store.add(&message);
    handler.enqueue(message.clone()).unwrap();
    store.flush(1).unwrap();
    store.sync();
    assert_eq!(dao.stored_ids(), vec![1]);

    let delivered = handler.take_for_delivery().unwrap();
    handler.dequeue(delivered.detachable()).unwrap();
    store.sync();
    assert!(dao.stored_ids().is_empty());
    assert!(handler.buffer().is_empty());
}

#[test]
fn test_durable_handler_recovers_stored_messages() {
    let dao = RecordingDao::new();
    {
        let store = Arc::new(SharedMessageStore::new(dao.clone(), &settings().store).unwrap());
        for id in 1..=3 {
            let message = persistent(id, "recovered");
            store.add(&message);
            store.attach("q", id).unwrap();
            store.flush(id).unwrap();
        }
        store.close();
    }

    let store = Arc::new(SharedMessageStore::new(dao, &settings().store).unwrap());
    let handler = QueueHandler::durable("q", store, &settings().broker).unwrap();
    assert_eq!(handler.buffer().ids(), vec![1, 2, 3]);
    assert_eq!(handler.size(), 3);
}

#[test]
fn test_purge_refused_with_consumers() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    handler.enqueue(transient(1)).unwrap();
    handler.enqueue(transient(2)).unwrap();

    let consumer = RecordingConsumer::new("c1", "q");
    assert!(handler.add_consumer(consumer));
    assert!(matches!(
        handler.purge(),
        Err(BrokerError::QueueInUse { consumers: 1, .. })
    ));

    assert!(handler.remove_consumer("c1"));
    assert_eq!(handler.purge().unwrap(), 2);
    assert!(handler.is_empty());
}

#[test]
fn test_consumers_round_robin_skipping_unready() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    let first = RecordingConsumer::new("c1", "q");
    let second = RecordingConsumer::new("c2", "q");
    let third = RecordingConsumer::new("c3", "q");
    handler.add_consumer(first.clone());
    handler.add_consumer(second.clone());
    handler.add_consumer(third.clone());
    assert!(!handler.add_consumer(first.clone()));

    second.ready.store(false, Ordering::SeqCst);
    let picked: Vec<String> = (0..4)
        .filter_map(|_| handler.next_consumer())
        .map(|consumer| consumer.id().to_string())
        .collect();
    assert_eq!(picked, vec!["c1", "c3", "c1", "c3"]);

    first.ready.store(false, Ordering::SeqCst);
    third.ready.store(false, Ordering::SeqCst);
    assert!(handler.next_consumer().is_none());
    assert!(!handler.has_ready_consumer());
}

#[test]
fn test_delivery_tags_increase_from_one() {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    assert_eq!(handler.next_delivery_tag(), 1);
    assert_eq!(handler.next_delivery_tag(), 2);
}
