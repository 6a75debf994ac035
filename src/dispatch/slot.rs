use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::store::Message;
use crate::utils::error::Result;

/// One delivery handed to a consumer, carrying the message and the ticket
/// behind it.
///
/// Settle it with [`Delivery::ack`] or [`Delivery::nack`]. Settling a
/// ticket that is already closed (duplicate ack after a reconnect race,
/// timeout beat the handler) is a no-op.
pub struct Delivery {
    pub message: Message,
    ticket_id: u64,
    dispatcher: Arc<Dispatcher>,
}

impl Delivery {
    pub(crate) fn new(message: Message, ticket_id: u64, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            message,
            ticket_id,
            dispatcher,
        }
    }

    pub fn ticket_id(&self) -> u64 {
        self.ticket_id
    }

    /// The message was processed; remove it permanently.
    pub fn ack(self) -> Result<()> {
        self.dispatcher.ack(self.ticket_id)
    }

    /// The message was not processed. With `requeue` it returns to the tail
    /// of its queue with the delivery count incremented; without it the
    /// message is dropped.
    pub fn nack(self, requeue: bool) -> Result<()> {
        self.dispatcher.nack(self.ticket_id, requeue)
    }
}

/// Pull-mode consumer handle: one slot on a queue.
///
/// Deliveries arrive in FIFO order, at most `prefetch` unsettled at a
/// time. Dropping the subscription deregisters the slot and requeues its
/// open deliveries.
pub struct Subscription {
    consumer_id: Uuid,
    rx: mpsc::UnboundedReceiver<Delivery>,
    dispatcher: Arc<Dispatcher>,
}

impl Subscription {
    pub(crate) fn new(
        consumer_id: Uuid,
        rx: mpsc::UnboundedReceiver<Delivery>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            consumer_id,
            rx,
            dispatcher,
        }
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    /// Waits for the next delivery. Returns `None` once the channel that
    /// owns this slot is closed.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.consumer_id);
    }
}
