use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, warn};
use uuid::Uuid;

use crate::channel::{Channel, QueueRef};
use crate::dispatch::Subscription;
use crate::store::Message;
use crate::utils::error::Result;

/// What a subscribed handler returns per message.
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Attaches handlers or pull-mode subscriptions to a single queue.
pub struct Consumer {
    channel: Arc<Channel>,
    queue: QueueRef,
}

impl Consumer {
    pub fn new(channel: Arc<Channel>, queue: QueueRef) -> Self {
        Self { channel, queue }
    }

    /// Callback mode: `handler` is invoked once per delivery, in FIFO order
    /// for this slot. `Ok` acks the message; an error or a panic nacks it
    /// back onto the queue. The dispatch worker never dies on a handler
    /// failure.
    pub fn subscribe<F>(&self, handler: F) -> Result<Uuid>
    where
        F: Fn(Message) -> HandlerFuture + Send + Sync + 'static,
    {
        let mut sub = self.channel.consume(&self.queue)?;
        let consumer_id = sub.consumer_id();
        tokio::spawn(async move {
            while let Some(delivery) = sub.next_delivery().await {
                let outcome = AssertUnwindSafe(handler(delivery.message.clone()))
                    .catch_unwind()
                    .await;
                let settled = match outcome {
                    Ok(Ok(())) => delivery.ack(),
                    Ok(Err(e)) => {
                        warn!(message = delivery.message.id, error = %e, "handler failed; requeueing");
                        delivery.nack(true)
                    }
                    Err(_) => {
                        error!(message = delivery.message.id, "handler panicked; requeueing");
                        delivery.nack(true)
                    }
                };
                if let Err(e) = settled {
                    warn!(error = %e, "failed to settle delivery");
                }
            }
        });
        Ok(consumer_id)
    }

    /// Pull mode: the caller drives the loop and settles each delivery
    /// itself via `Delivery::ack` / `Delivery::nack`.
    pub fn deliveries(&self) -> Result<Subscription> {
        self.channel.consume(&self.queue)
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }
}
