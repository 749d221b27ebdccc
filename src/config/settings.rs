use serde::Deserialize;

/// Top-level configuration settings for the broker core.
///
/// Includes settings for the durable store pipeline, the queues and the
/// delivery scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub broker: BrokerSettings,
    pub delivery: DeliverySettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the durable store pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
    pub ring_buffer_size: usize,
    pub max_db_batch_size: usize,
}

/// Configuration settings for queues.
///
/// `durable_queue_in_memory_cache_limit` bounds how many persistent messages of
/// a durable queue are held with their content; the rest are re-read on demand.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub durable_queue_in_memory_cache_limit: usize,
    pub non_durable_queue_max_depth: usize,
}

/// Configuration settings for the delivery scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliverySettings {
    pub worker_count: usize,
    pub idle_task_delay_ms: u64,
    pub batch_limit: usize,
    pub failure_policy: DeliveryFailurePolicy,
    /// Redeliveries after which a requeued message goes to the dead letter
    /// queue instead.
    pub max_redelivery_count: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// What the delivery task does with a message a consumer failed to accept.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryFailurePolicy {
    /// Log the failure and leave the message in flight.
    #[default]
    Log,
    /// Mark the message redelivered and offer it again on the next run,
    /// dead-lettering it once it exceeds `max_redelivery_count`.
    Requeue,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub ring_buffer_size: Option<usize>,
    pub max_db_batch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub durable_queue_in_memory_cache_limit: Option<usize>,
    pub non_durable_queue_max_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeliverySettings {
    pub worker_count: Option<usize>,
    pub idle_task_delay_ms: Option<u64>,
    pub batch_limit: Option<usize>,
    pub failure_policy: Option<DeliveryFailurePolicy>,
    pub max_redelivery_count: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings {
                path: "popcore_db".to_string(),
                ring_buffer_size: 4096,
                max_db_batch_size: 1024,
            },
            broker: BrokerSettings {
                durable_queue_in_memory_cache_limit: 10_000,
                non_durable_queue_max_depth: 10_000,
            },
            delivery: DeliverySettings {
                worker_count: 5,
                idle_task_delay_ms: 50,
                batch_limit: 1000,
                failure_policy: DeliveryFailurePolicy::Log,
                max_redelivery_count: 10,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Merge the values that were provided over `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let store = self.store.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let delivery = self.delivery.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            store: StoreSettings {
                path: store.path.unwrap_or(defaults.store.path),
                ring_buffer_size: store
                    .ring_buffer_size
                    .unwrap_or(defaults.store.ring_buffer_size),
                max_db_batch_size: store
                    .max_db_batch_size
                    .unwrap_or(defaults.store.max_db_batch_size),
            },
            broker: BrokerSettings {
                durable_queue_in_memory_cache_limit: broker
                    .durable_queue_in_memory_cache_limit
                    .unwrap_or(defaults.broker.durable_queue_in_memory_cache_limit),
                non_durable_queue_max_depth: broker
                    .non_durable_queue_max_depth
                    .unwrap_or(defaults.broker.non_durable_queue_max_depth),
            },
            delivery: DeliverySettings {
                worker_count: delivery
                    .worker_count
                    .unwrap_or(defaults.delivery.worker_count),
                idle_task_delay_ms: delivery
                    .idle_task_delay_ms
                    .unwrap_or(defaults.delivery.idle_task_delay_ms),
                batch_limit: delivery
                    .batch_limit
                    .unwrap_or(defaults.delivery.batch_limit),
                failure_policy: delivery
                    .failure_policy
                    .unwrap_or(defaults.delivery.failure_policy),
                max_redelivery_count: delivery
                    .max_redelivery_count
                    .unwrap_or(defaults.delivery.max_redelivery_count),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
