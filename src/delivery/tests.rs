use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{DeliveryTask, Task, TaskHint, TaskScheduler};
use crate::config::DeliveryFailurePolicy;
use crate::queue::QueueHandler;
use crate::tests::support::{RecordingConsumer, message, settings};

fn loaded_queue(count: u64) -> Arc<QueueHandler> {
    let handler = QueueHandler::in_memory("q", &settings().broker);
    for id in 1..=count {
        handler.enqueue(message(id, "q", false, "m")).unwrap();
    }
    handler
}

struct CountingTask {
    id: String,
    runs: AtomicUsize,
    removed: AtomicUsize,
}

impl CountingTask {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            runs: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        })
    }
}

impl Task for CountingTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self) -> TaskHint {
        self.runs.fetch_add(1, Ordering::SeqCst);
        TaskHint::Idle
    }

    fn on_remove(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_delivery_stops_at_batch_limit() {
    let handler = loaded_queue(1001);
    let consumer = RecordingConsumer::new("c1", "q");
    handler.add_consumer(consumer.clone());
    let task = DeliveryTask::new(handler.clone(), &settings().delivery);

    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(consumer.ids().len(), 1000);
    assert_eq!(handler.size(), 1);

    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(consumer.ids().len(), 1001);
    assert_eq!(consumer.ids(), (1..=1001).collect::<Vec<u64>>());

    assert_eq!(task.run(), TaskHint::Idle);
}

#[test]
fn test_delivery_round_robin_between_consumers() {
    let handler = loaded_queue(4);
    let first = RecordingConsumer::new("c1", "q");
    let second = RecordingConsumer::new("c2", "q");
    handler.add_consumer(first.clone());
    handler.add_consumer(second.clone());

    let task = DeliveryTask::new(handler, &settings().delivery);
    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(first.ids(), vec![1, 3]);
    assert_eq!(second.ids(), vec![2, 4]);
}

#[test]
fn test_empty_pass_keeps_round_robin_turn() {
    let handler = loaded_queue(1);
    let first = RecordingConsumer::new("c1", "q");
    let second = RecordingConsumer::new("c2", "q");
    handler.add_consumer(first.clone());
    handler.add_consumer(second.clone());
    let task = DeliveryTask::new(handler.clone(), &settings().delivery);

    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(task.run(), TaskHint::Idle);
    assert_eq!(task.run(), TaskHint::Idle);

    handler.enqueue(message(2, "q", false, "m")).unwrap();
    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(first.ids(), vec![1]);
    assert_eq!(second.ids(), vec![2]);
}

#[test]
fn test_undelivered_message_returns_without_redelivery_mark() {
    let handler = loaded_queue(2);
    let taken = handler.take_for_delivery().unwrap();
    handler.restore_undelivered(taken);

    let again = handler.take_for_delivery().unwrap();
    assert_eq!(again.internal_id(), 1);
    assert!(!again.is_redelivered());
    assert_eq!(handler.take_for_delivery().unwrap().internal_id(), 2);
}

#[test]
fn test_delivery_without_consumers_is_idle() {
    let handler = loaded_queue(3);
    let task = DeliveryTask::new(handler.clone(), &settings().delivery);
    assert_eq!(task.run(), TaskHint::Idle);
    assert_eq!(handler.size(), 3);
}

#[test]
fn test_delivery_tags_follow_queue_sequence() {
    let handler = loaded_queue(3);
    let consumer = RecordingConsumer::new("c1", "q");
    handler.add_consumer(consumer.clone());
    DeliveryTask::new(handler, &settings().delivery).run();

    let tags: Vec<u64> = consumer.received.lock().iter().map(|(_, tag)| *tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);
}

#[test]
fn test_failed_send_with_requeue_policy() {
    let handler = loaded_queue(2);
    let consumer = RecordingConsumer::new("c1", "q");
    consumer.failing.store(true, Ordering::SeqCst);
    handler.add_consumer(consumer.clone());

    let mut config = settings();
    config.delivery.failure_policy = DeliveryFailurePolicy::Requeue;
    let task = DeliveryTask::new(handler.clone(), &config.delivery);

    assert_eq!(task.run(), TaskHint::Idle);
    assert_eq!(handler.size(), 2);

    consumer.failing.store(false, Ordering::SeqCst);
    assert_eq!(task.run(), TaskHint::Active);
    assert_eq!(consumer.ids(), vec![1, 2]);
}

#[test]
fn test_failed_send_with_log_policy_leaves_message_in_flight() {
    let handler = loaded_queue(1);
    let consumer = RecordingConsumer::new("c1", "q");
    consumer.failing.store(true, Ordering::SeqCst);
    handler.add_consumer(consumer.clone());
    let task = DeliveryTask::new(handler.clone(), &settings().delivery);

    assert_eq!(task.run(), TaskHint::Idle);
    assert_eq!(handler.size(), 0);
    assert_eq!(handler.buffer().in_flight(), 1);
}

#[test]
fn test_scheduler_add_replace_and_remove() {
    let scheduler = TaskScheduler::new(&settings().delivery);
    let first = CountingTask::new("t");
    let replacement = CountingTask::new("t");

    scheduler.add(first.clone());
    scheduler.add(replacement.clone());
    assert_eq!(scheduler.len(), 1);
    assert_eq!(first.removed.load(Ordering::SeqCst), 1);

    assert_eq!(scheduler.run_once(), 0);
    assert_eq!(first.runs.load(Ordering::SeqCst), 0);
    assert_eq!(replacement.runs.load(Ordering::SeqCst), 1);

    assert!(scheduler.remove("t"));
    assert!(!scheduler.remove("t"));
    assert_eq!(replacement.removed.load(Ordering::SeqCst), 1);
    assert!(scheduler.is_empty());
}

#[test]
fn test_run_once_counts_active_tasks() {
    let scheduler = TaskScheduler::new(&settings().delivery);
    let busy = loaded_queue(1);
    busy.add_consumer(RecordingConsumer::new("c1", "q"));
    let idle = QueueHandler::in_memory("empty", &settings().broker);

    scheduler.add(Arc::new(DeliveryTask::new(busy, &settings().delivery)));
    scheduler.add(Arc::new(DeliveryTask::new(idle, &settings().delivery)));
    assert!(scheduler.contains("q"));
    assert!(scheduler.contains("empty"));
    assert_eq!(scheduler.run_once(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduler_workers_deliver_new_messages() {
    let handler = loaded_queue(5);
    let consumer = RecordingConsumer::new("c1", "q");
    handler.add_consumer(consumer.clone());

    let scheduler = Arc::new(TaskScheduler::new(&settings().delivery));
    scheduler.add(Arc::new(DeliveryTask::new(handler.clone(), &settings().delivery)));
    scheduler.start();
    assert!(scheduler.is_running());

    let mut waited = 0;
    while consumer.ids().len() < 5 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(consumer.ids(), vec![1, 2, 3, 4, 5]);

    // Idle tasks are polled again after the idle delay.
    handler.enqueue(message(6, "q", false, "late")).unwrap();
    let mut waited = 0;
    while consumer.ids().len() < 6 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(consumer.ids().len(), 6);

    scheduler.stop();
    assert!(!scheduler.is_running());
}
