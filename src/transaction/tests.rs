use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{PostTransactionAction, Xid};
use crate::broker::{Broker, Message};
use crate::persistence::dao::MessageDao;
use crate::tests::support::{RecordingDao, message, settings};
use crate::utils::BrokerError;

type Log = Arc<Mutex<Vec<String>>>;

struct Hook {
    name: &'static str,
    log: Log,
}

impl PostTransactionAction for Hook {
    fn post_commit(&mut self) {
        self.log.lock().push(format!("commit:{}", self.name));
    }

    fn on_rollback(&mut self) {
        self.log.lock().push(format!("rollback:{}", self.name));
    }
}

fn hook(name: &'static str, log: &Log) -> Option<Box<dyn PostTransactionAction>> {
    Some(Box::new(Hook {
        name,
        log: log.clone(),
    }))
}

fn broker_with(dao: &Arc<RecordingDao>) -> Arc<Broker> {
    let broker = Broker::with_dao(dao.clone(), settings()).unwrap();
    broker.declare_queue("q", true).unwrap();
    broker
}

fn next_message(broker: &Broker, body: &str) -> Message {
    message(broker.next_message_id().unwrap(), "q", true, body)
}

fn queued_ids(broker: &Broker) -> Vec<u64> {
    broker.queue("q").unwrap().buffer().ids()
}

fn is_validation<T>(result: Result<T, BrokerError>) -> bool {
    matches!(result, Err(BrokerError::Validation(_)))
}

#[test]
fn test_auto_commit_enqueue_runs_hook() {
    let broker = broker_with(&RecordingDao::new());
    let log = Log::default();
    let mut tx = broker.new_auto_commit_transaction();

    let published = next_message(&broker, "a");
    tx.enqueue(published.clone(), hook("a", &log)).unwrap();

    assert_eq!(*log.lock(), vec!["commit:a"]);
    assert_eq!(queued_ids(&broker), vec![published.internal_id()]);
    assert!(!tx.is_transactional());
    assert!(tx.commit().is_ok());
    assert!(tx.rollback().is_ok());
}

#[test]
fn test_auto_commit_dequeue_hook_runs_even_on_failure() {
    let broker = broker_with(&RecordingDao::new());
    let log = Log::default();
    let mut tx = broker.new_auto_commit_transaction();

    let orphan = next_message(&broker, "x");
    let result = tx.dequeue("missing", orphan.detachable().clone(), hook("ack", &log));

    assert!(matches!(result, Err(BrokerError::UnknownQueue(_))));
    assert_eq!(*log.lock(), vec!["commit:ack"]);
}

#[test]
fn test_local_commit_runs_hooks_in_order() {
    let broker = broker_with(&RecordingDao::new());
    let log = Log::default();
    let mut tx = broker.new_local_transaction();

    tx.enqueue(next_message(&broker, "1"), hook("first", &log)).unwrap();
    tx.enqueue(next_message(&broker, "2"), hook("second", &log)).unwrap();
    assert!(log.lock().is_empty());
    assert!(tx.is_transactional());

    tx.commit().unwrap();
    assert_eq!(*log.lock(), vec!["commit:first", "commit:second"]);
    assert_eq!(queued_ids(&broker).len(), 2);
}

#[test]
fn test_local_commit_refused_after_failed_operation() {
    let broker = broker_with(&RecordingDao::new());
    let log = Log::default();
    let mut tx = broker.new_local_transaction();

    tx.enqueue(next_message(&broker, "ok"), hook("ok", &log)).unwrap();
    let orphan = next_message(&broker, "gone");
    assert!(tx.dequeue("missing", orphan.detachable().clone(), hook("bad", &log)).is_err());

    assert!(is_validation(tx.commit()));
    assert!(log.lock().is_empty());

    tx.rollback().unwrap();
    assert_eq!(*log.lock(), vec!["rollback:ok", "rollback:bad"]);
}

#[test]
fn test_local_transaction_rolled_back_on_close() {
    let broker = broker_with(&RecordingDao::new());
    let log = Log::default();
    let mut tx = broker.new_local_transaction();
    tx.enqueue(next_message(&broker, "1"), hook("pending", &log)).unwrap();

    tx.on_close();
    assert_eq!(*log.lock(), vec!["rollback:pending"]);
}

#[test]
fn test_dtx_operations_refused_outside_distributed_session() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");

    let mut auto = broker.new_auto_commit_transaction();
    assert!(is_validation(auto.start(&xid, false, false)));
    assert!(is_validation(auto.prepare(&xid)));

    let mut local = broker.new_local_transaction();
    assert!(is_validation(local.commit_xid(&xid, true)));
    assert!(is_validation(local.set_timeout(&xid, Duration::from_secs(1))));

    let mut distributed = broker.new_distributed_transaction(1);
    assert!(is_validation(distributed.commit()));
}

#[test]
fn test_dtx_two_phase_commit() {
    let dao = RecordingDao::new();
    let broker = broker_with(&dao);
    let xid = Xid::new(1, "global", "branch");
    let mut tx = broker.new_distributed_transaction(1);

    tx.start(&xid, false, false).unwrap();
    assert!(tx.is_transactional());
    let enqueued = next_message(&broker, "tx");
    tx.enqueue(enqueued.clone(), None).unwrap();
    tx.end(&xid, false, false).unwrap();
    assert!(queued_ids(&broker).is_empty());

    tx.prepare(&xid).unwrap();
    assert_eq!(broker.dtx_registry().prepared_xids(), vec![xid.clone()]);
    assert!(dao.stored_ids().is_empty());

    tx.commit_xid(&xid, false).unwrap();
    assert_eq!(queued_ids(&broker), vec![enqueued.internal_id()]);
    assert_eq!(dao.stored_ids(), vec![enqueued.internal_id()]);
    assert!(!broker.dtx_registry().is_registered(&xid));
    assert!(broker.store().stored_xids().unwrap().is_empty());
}

#[test]
fn test_dtx_commit_phase_checks() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);

    tx.start(&xid, false, false).unwrap();
    assert!(is_validation(tx.commit_xid(&xid, true)));
    tx.end(&xid, false, false).unwrap();

    assert!(is_validation(tx.commit_xid(&xid, false)));
    tx.prepare(&xid).unwrap();
    assert!(is_validation(tx.commit_xid(&xid, true)));
    tx.commit_xid(&xid, false).unwrap();

    assert!(matches!(
        tx.commit_xid(&xid, false),
        Err(BrokerError::UnknownXid(_))
    ));
}

#[test]
fn test_dtx_one_phase_commit_of_dequeue() {
    let dao = RecordingDao::new();
    let broker = broker_with(&dao);
    let published = next_message(&broker, "consume me");
    broker.publish(published.clone()).unwrap();
    broker.store().sync();
    let delivered = broker.queue("q").unwrap().take_for_delivery().unwrap();

    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);
    tx.start(&xid, false, false).unwrap();
    tx.dequeue("q", delivered.detachable().clone(), None).unwrap();
    tx.end(&xid, false, false).unwrap();
    assert_eq!(queued_ids(&broker), vec![published.internal_id()]);

    tx.commit_xid(&xid, true).unwrap();
    assert!(queued_ids(&broker).is_empty());
    assert!(dao.stored_ids().is_empty());
}

#[test]
fn test_dtx_start_checks() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut first = broker.new_distributed_transaction(1);
    let mut second = broker.new_distributed_transaction(2);

    assert!(is_validation(first.start(&xid, true, true)));
    assert!(matches!(
        first.start(&xid, true, false),
        Err(BrokerError::UnknownXid(_))
    ));

    first.start(&xid, false, false).unwrap();
    assert!(is_validation(second.start(&xid, false, false)));
    second.start(&xid, true, false).unwrap();
}

#[test]
fn test_dtx_suspend_and_resume() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut owner = broker.new_distributed_transaction(1);
    let mut other = broker.new_distributed_transaction(2);

    owner.start(&xid, false, false).unwrap();
    owner.end(&xid, false, true).unwrap();
    assert!(!owner.is_transactional());

    assert!(is_validation(other.start(&xid, false, true)));
    owner.start(&xid, false, true).unwrap();
    assert!(is_validation(other.end(&xid, false, false)));
    owner.end(&xid, false, false).unwrap();
}

#[test]
fn test_dtx_failed_end_forces_rollback() {
    let dao = RecordingDao::new();
    let broker = broker_with(&dao);
    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);

    tx.start(&xid, false, false).unwrap();
    tx.enqueue(next_message(&broker, "never"), None).unwrap();
    tx.end(&xid, true, false).unwrap();

    assert!(is_validation(tx.prepare(&xid)));
    assert!(is_validation(tx.commit_xid(&xid, true)));
    tx.rollback_xid(&xid).unwrap();

    broker.store().sync();
    assert!(queued_ids(&broker).is_empty());
    assert!(dao.writes().is_empty());
    assert!(!broker.dtx_registry().is_registered(&xid));
}

#[test]
fn test_dtx_timeout_rolls_back_branch() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);

    tx.start(&xid, false, false).unwrap();
    tx.enqueue(next_message(&broker, "late"), None).unwrap();
    tx.end(&xid, false, false).unwrap();
    tx.set_timeout(&xid, Duration::from_millis(1)).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    assert!(is_validation(tx.prepare(&xid)));
    assert!(!broker.dtx_registry().is_registered(&xid));
    assert!(queued_ids(&broker).is_empty());
}

#[test]
fn test_expired_branches_swept() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);
    tx.start(&xid, false, false).unwrap();
    tx.set_timeout(&xid, Duration::from_millis(1)).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(broker.dtx_registry().rollback_expired(), 1);
    assert!(!broker.dtx_registry().is_registered(&xid));
}

#[test]
fn test_forget_requires_heuristic_outcome() {
    let broker = broker_with(&RecordingDao::new());
    let xid = Xid::new(1, "g", "b");
    let mut tx = broker.new_distributed_transaction(1);
    tx.start(&xid, false, false).unwrap();
    tx.end(&xid, false, false).unwrap();

    assert!(is_validation(tx.forget(&xid)));
    assert!(matches!(
        tx.forget(&Xid::new(1, "other", "b")),
        Err(BrokerError::UnknownXid(_))
    ));
}

#[test]
fn test_prepared_branch_committed_after_restart() {
    let dao = RecordingDao::new();
    let xid = Xid::new(7, "recover", "me");
    let enqueued_id = {
        let broker = broker_with(&dao);
        let mut tx = broker.new_distributed_transaction(1);
        tx.start(&xid, false, false).unwrap();
        let enqueued = next_message(&broker, "prepared");
        tx.enqueue(enqueued.clone(), None).unwrap();
        tx.end(&xid, false, false).unwrap();
        tx.prepare(&xid).unwrap();
        broker.shutdown();
        enqueued.internal_id()
    };

    let broker = broker_with(&dao);
    assert!(broker.next_message_id().unwrap() > enqueued_id);
    assert_eq!(broker.dtx_registry().prepared_xids(), vec![xid.clone()]);
    assert!(is_validation(broker.dtx_registry().branch(&xid)));
    assert!(queued_ids(&broker).is_empty());

    let mut tx = broker.new_distributed_transaction(2);
    tx.commit_xid(&xid, false).unwrap();

    assert_eq!(queued_ids(&broker), vec![enqueued_id]);
    assert_eq!(dao.stored_ids(), vec![enqueued_id]);
    assert!(broker.dtx_registry().prepared_xids().is_empty());
    assert!(dao.stored_xids().unwrap().is_empty());
}

#[test]
fn test_prepared_dequeue_committed_after_restart() {
    let dao = RecordingDao::new();
    let xid = Xid::new(7, "recover", "dequeue");
    let published_id = {
        let broker = broker_with(&dao);
        let published = next_message(&broker, "stored");
        broker.publish(published.clone()).unwrap();
        broker.store().sync();

        let mut tx = broker.new_distributed_transaction(1);
        tx.start(&xid, false, false).unwrap();
        tx.dequeue("q", published.detachable().clone(), None).unwrap();
        tx.end(&xid, false, false).unwrap();
        tx.prepare(&xid).unwrap();
        broker.shutdown();
        published.internal_id()
    };

    let broker = broker_with(&dao);
    assert_eq!(queued_ids(&broker), vec![published_id]);

    let mut tx = broker.new_distributed_transaction(2);
    tx.commit_xid(&xid, false).unwrap();
    assert!(queued_ids(&broker).is_empty());
    assert!(dao.stored_ids().is_empty());
}

#[test]
fn test_prepared_branch_rolled_back_after_restart() {
    let dao = RecordingDao::new();
    let xid = Xid::new(7, "recover", "rb");
    {
        let broker = broker_with(&dao);
        let mut tx = broker.new_distributed_transaction(1);
        tx.start(&xid, false, false).unwrap();
        tx.enqueue(next_message(&broker, "discarded"), None).unwrap();
        tx.end(&xid, false, false).unwrap();
        tx.prepare(&xid).unwrap();
        broker.shutdown();
    }

    let broker = broker_with(&dao);
    let mut tx = broker.new_distributed_transaction(2);
    tx.rollback_xid(&xid).unwrap();

    assert!(queued_ids(&broker).is_empty());
    assert!(dao.stored_ids().is_empty());
    assert!(dao.stored_xids().unwrap().is_empty());
    assert!(matches!(
        tx.rollback_xid(&xid),
        Err(BrokerError::UnknownXid(_))
    ));
}

#[test]
fn test_xid_equality_ignores_format() {
    let a = Xid::new(1, "g", "b");
    let b = Xid::new(2, "g", "b");
    assert_eq!(a, b);
    assert_ne!(a, Xid::new(1, "g", "c"));
    assert_eq!(a.to_key(), b.to_key());
    assert_ne!(Xid::new(1, "ab", "c").to_key(), Xid::new(1, "a", "bc").to_key());
}
