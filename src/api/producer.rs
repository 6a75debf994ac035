use std::sync::Arc;

use tracing::debug;

use crate::channel::{Channel, QueueRef};
use crate::transport::{Backoff, BackoffPolicy};
use crate::utils::error::{Error, Result};

/// Publishes messages to a single queue, retrying transient failures.
///
/// Callers only see an error after the retry budget is spent, and then as
/// `Error::SendFailed` wrapping the last underlying failure.
pub struct Producer {
    channel: Arc<Channel>,
    queue: QueueRef,
    persistent: bool,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl Producer {
    pub fn new(channel: Arc<Channel>, queue: QueueRef, persistent: bool) -> Self {
        Self {
            channel,
            queue,
            persistent,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.max_attempts = max_attempts;
        self.backoff = backoff;
        self
    }

    /// Sends one payload. Transient failures (link down, channel briefly
    /// unavailable) are retried with exponential backoff.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<u64> {
        let payload = payload.into();
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut last = None;
        for attempt in 1..=self.max_attempts {
            match self.channel.publish(&self.queue, payload.clone(), self.persistent) {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() => {
                    debug!(attempt, error = %e, "publish failed; backing off");
                    last = Some(e);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::SendFailed {
            attempts: self.max_attempts,
            source: Box::new(last.unwrap_or_else(|| Error::Publish("no attempt was made".into()))),
        })
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }
}
