//! Polls pull-based tasks from a fixed set of tokio workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::DeliverySettings;
use crate::delivery::task::{Task, TaskHint};

struct Registered {
    generation: u64,
    task: Arc<dyn Task>,
}

/// Active tasks go straight back on the ready queue, idle ones after
/// `idle_delay`. Each registration carries a generation so a task that was
/// removed and added again is never polled twice at once.
pub struct TaskScheduler {
    tasks: DashMap<String, Registered>,
    ready: Mutex<VecDeque<(String, u64)>>,
    notify: Notify,
    generation: AtomicU64,
    idle_delay: Duration,
    worker_count: usize,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(settings: &DeliverySettings) -> Self {
        Self {
            tasks: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
            idle_delay: Duration::from_millis(settings.idle_task_delay_ms),
            worker_count: settings.worker_count.max(1),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers `task`, replacing any task with the same id.
    pub fn add(&self, task: Arc<dyn Task>) {
        let id = task.id().to_string();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.tasks.insert(id.clone(), Registered { generation, task }) {
            previous.task.on_remove();
        }
        debug!(task = %id, "task added");
        self.schedule(id, generation);
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some((_, registered)) => {
                registered.task.on_remove();
                debug!(task = id, "task removed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn schedule(&self, id: String, generation: u64) {
        self.ready.lock().push_back((id, generation));
        self.notify.notify_one();
    }

    fn current(&self, id: &str, generation: u64) -> Option<Arc<dyn Task>> {
        self.tasks
            .get(id)
            .filter(|registered| registered.generation == generation)
            .map(|registered| registered.task.clone())
    }

    /// Polls every registered task once on the calling thread and returns
    /// how many reported active.
    pub fn run_once(&self) -> usize {
        let tasks: Vec<Arc<dyn Task>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().task.clone())
            .collect();
        tasks
            .iter()
            .filter(|task| task.run() == TaskHint::Active)
            .count()
    }

    /// Spawns the workers on the current tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker in 0..self.worker_count {
            let scheduler = self.clone();
            workers.push(tokio::spawn(async move { scheduler.work(worker).await }));
        }
        info!(workers = self.worker_count, "task scheduler started");
    }

    async fn work(self: Arc<Self>, worker: usize) {
        while self.running.load(Ordering::Acquire) {
            let next = self.ready.lock().pop_front();
            let Some((id, generation)) = next else {
                let _ = tokio::time::timeout(self.idle_delay, self.notify.notified()).await;
                continue;
            };
            let Some(task) = self.current(&id, generation) else {
                continue;
            };

            let hint = match tokio::task::spawn_blocking(move || task.run()).await {
                Ok(hint) => hint,
                Err(e) => {
                    error!(task = %id, worker, error = %e, "task panicked");
                    TaskHint::Idle
                }
            };

            match hint {
                TaskHint::Active => self.schedule(id, generation),
                TaskHint::Idle => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(scheduler.idle_delay).await;
                        if scheduler.current(&id, generation).is_some() {
                            scheduler.schedule(id, generation);
                        }
                    });
                }
            }
        }
    }

    /// Stops the workers. Registered tasks are kept.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        info!("task scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
