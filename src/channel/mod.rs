//! The `channel` module provides the logical session over a transport.
//!
//! A channel owns the delivery-ticket lifecycle and the dispatch loop for
//! its consumers. Publishing appends to the queue store before the call
//! returns; acknowledgments settle tickets idempotently. Closing a channel
//! cancels its dispatch loop and requeues everything still in flight.

pub mod ticket;

pub use ticket::{DeliveryTicket, TicketState};

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatch::{Dispatcher, Subscription};
use crate::store::QueueStore;
use crate::transport::Transport;
use crate::utils::error::{Error, Result};

/// Handle to a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRef {
    pub name: String,
    pub durable: bool,
}

/// Knobs for [`Channel::open_with`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Max unacknowledged deliveries per consumer slot.
    pub prefetch: usize,
    /// Force-requeue a delivery whose consumer never settles it.
    pub delivery_timeout: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            delivery_timeout: None,
        }
    }
}

/// A logical session multiplexed over a transport.
pub struct Channel {
    transport: Arc<Transport>,
    store: Arc<QueueStore>,
    dispatcher: Arc<Dispatcher>,
    open: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Opens a channel with default options (prefetch 1, no timeout).
    pub fn open(transport: Arc<Transport>, store: Arc<QueueStore>) -> Result<Arc<Self>> {
        Self::open_with(transport, store, ChannelOptions::default())
    }

    /// Opens a channel over a connected transport and starts its dispatch
    /// loop. Fails if the transport is not currently connected.
    pub fn open_with(
        transport: Arc<Transport>,
        store: Arc<QueueStore>,
        options: ChannelOptions,
    ) -> Result<Arc<Self>> {
        if !transport.is_connected() {
            return Err(Error::Channel("transport is not connected".into()));
        }
        if options.prefetch == 0 {
            return Err(Error::Channel("prefetch must be at least 1".into()));
        }
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), options.prefetch));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel = Arc::new(Self {
            transport: Arc::clone(&transport),
            store,
            dispatcher: Arc::clone(&dispatcher),
            open: AtomicBool::new(true),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        });
        let handle = tokio::spawn(dispatcher.run(transport, shutdown_rx, options.delivery_timeout));
        *channel.loop_handle.lock().unwrap() = Some(handle);
        debug!("channel opened");
        Ok(channel)
    }

    /// Declares a queue. Safe to repeat with the same durability flag; a
    /// conflicting flag fails with `Error::QueueConflict`.
    pub fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueRef> {
        self.ensure_open()?;
        self.store.declare(name, durable)?;
        Ok(QueueRef {
            name: name.to_string(),
            durable,
        })
    }

    /// Bounds concurrent unacknowledged deliveries per consumer slot.
    pub fn set_prefetch(&self, n: usize) -> Result<()> {
        self.ensure_open()?;
        if n == 0 {
            return Err(Error::Channel("prefetch must be at least 1".into()));
        }
        self.dispatcher.set_prefetch(n);
        Ok(())
    }

    /// Appends a message to the queue and returns its id. When this
    /// returns the message is in the store; with `persistent` it has also
    /// been flushed to disk.
    pub fn publish(
        &self,
        queue: &QueueRef,
        payload: impl Into<Vec<u8>>,
        persistent: bool,
    ) -> Result<u64> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Publish("channel is closed".into()));
        }
        if !self.transport.is_connected() {
            return Err(Error::Connection("transport is not connected".into()));
        }
        let id = self.store.enqueue(&queue.name, payload.into(), persistent)?;
        self.dispatcher.notify();
        Ok(id)
    }

    /// Registers a pull-mode consumer slot on `queue`.
    pub fn consume(&self, queue: &QueueRef) -> Result<Subscription> {
        self.ensure_open()?;
        if self.store.declared(&queue.name).is_none() {
            return Err(Error::UnknownQueue(queue.name.clone()));
        }
        Ok(Dispatcher::register(&self.dispatcher, &queue.name))
    }

    /// Acknowledges the delivery behind `ticket_id`. No-op if the ticket is
    /// already closed.
    pub fn ack(&self, ticket_id: u64) -> Result<()> {
        self.dispatcher.ack(ticket_id)
    }

    /// Rejects the delivery behind `ticket_id`. No-op if the ticket is
    /// already closed.
    pub fn nack(&self, ticket_id: u64, requeue: bool) -> Result<()> {
        self.dispatcher.nack(ticket_id, requeue)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Closes the channel: stops the dispatch loop, requeues every open
    /// delivery, and drops all consumer slots. Idempotent.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.dispatcher.close();
        info!("channel closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Channel("channel is closed".into()))
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("open", &self.is_open())
            .field("transport", &self.transport)
            .finish()
    }
}
