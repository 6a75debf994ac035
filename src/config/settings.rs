use serde::Deserialize;

use crate::transport::BackoffPolicy;
use crate::utils::error::{Error, Result};

/// Top-level configuration for the work-queue client.
///
/// Covers the broker endpoint, the storage location, and the queue,
/// consumer, and producer knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub endpoint: String,
    pub store_path: String,
    pub queue: QueueSettings,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
    pub backoff: BackoffPolicy,
}

/// The queue worked against by both the producer and the consumer.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub durable: bool,
}

/// Consumer-side knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub prefetch: usize,
    pub delivery_timeout_ms: Option<u64>,
}

/// Producer-side knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct ProducerSettings {
    pub persistent: bool,
    pub max_retries: u32,
}

/// Partial configuration loaded from files or environment.
///
/// Allows partial specification of settings; missing values are filled
/// from the defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub endpoint: Option<String>,
    pub store_path: Option<String>,
    pub queue: Option<PartialQueueSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub producer: Option<PartialProducerSettings>,
    pub backoff: Option<PartialBackoffSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub name: Option<String>,
    pub durable: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub prefetch: Option<usize>,
    pub delivery_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialProducerSettings {
    pub persistent: Option<bool>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBackoffSettings {
    pub base_ms: Option<u64>,
    pub factor: Option<f64>,
    pub cap_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "mem://local".to_string(),
            store_path: "relayq_db".to_string(),
            queue: QueueSettings {
                name: "terminal_queue".to_string(),
                durable: true,
            },
            consumer: ConsumerSettings {
                prefetch: 1,
                delivery_timeout_ms: None,
            },
            producer: ProducerSettings {
                persistent: true,
                max_retries: 5,
            },
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PartialSettings {
    /// Fills every missing field from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            endpoint: self.endpoint.unwrap_or(default.endpoint),
            store_path: self.store_path.unwrap_or(default.store_path),
            queue: QueueSettings {
                name: self
                    .queue
                    .as_ref()
                    .and_then(|q| q.name.clone())
                    .unwrap_or(default.queue.name),
                durable: self
                    .queue
                    .as_ref()
                    .and_then(|q| q.durable)
                    .unwrap_or(default.queue.durable),
            },
            consumer: ConsumerSettings {
                prefetch: self
                    .consumer
                    .as_ref()
                    .and_then(|c| c.prefetch)
                    .unwrap_or(default.consumer.prefetch),
                delivery_timeout_ms: self
                    .consumer
                    .as_ref()
                    .and_then(|c| c.delivery_timeout_ms)
                    .or(default.consumer.delivery_timeout_ms),
            },
            producer: ProducerSettings {
                persistent: self
                    .producer
                    .as_ref()
                    .and_then(|p| p.persistent)
                    .unwrap_or(default.producer.persistent),
                max_retries: self
                    .producer
                    .as_ref()
                    .and_then(|p| p.max_retries)
                    .unwrap_or(default.producer.max_retries),
            },
            backoff: BackoffPolicy {
                base_ms: self
                    .backoff
                    .as_ref()
                    .and_then(|b| b.base_ms)
                    .unwrap_or(default.backoff.base_ms),
                factor: self
                    .backoff
                    .as_ref()
                    .and_then(|b| b.factor)
                    .unwrap_or(default.backoff.factor),
                cap_ms: self
                    .backoff
                    .as_ref()
                    .and_then(|b| b.cap_ms)
                    .unwrap_or(default.backoff.cap_ms),
                jitter_ms: self
                    .backoff
                    .as_ref()
                    .and_then(|b| b.jitter_ms)
                    .unwrap_or(default.backoff.jitter_ms),
            },
        }
    }
}

impl Settings {
    /// Rejects configurations the core cannot run with. Called before any
    /// connection attempt so bad config fails fast.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint must not be empty".into()));
        }
        if self.store_path.trim().is_empty() {
            return Err(Error::Config("store_path must not be empty".into()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(Error::Config("queue.name must not be empty".into()));
        }
        if self.consumer.prefetch == 0 {
            return Err(Error::Config("consumer.prefetch must be at least 1".into()));
        }
        if self.producer.max_retries == 0 {
            return Err(Error::Config("producer.max_retries must be at least 1".into()));
        }
        if self.backoff.factor < 1.0 {
            return Err(Error::Config("backoff.factor must be at least 1.0".into()));
        }
        Ok(())
    }

    /// Consumer delivery timeout as a `Duration`, when configured.
    pub fn delivery_timeout(&self) -> Option<std::time::Duration> {
        self.consumer
            .delivery_timeout_ms
            .map(std::time::Duration::from_millis)
    }
}
