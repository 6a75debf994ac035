//! The `dispatch` module pulls stored messages and delivers them to
//! consumer slots, fairly and bounded by prefetch.
//!
//! One dispatcher (and one dispatch loop) exists per channel. The loop is
//! cooperative: it parks while the transport is away, while every slot is
//! at its prefetch limit, or while the queues are empty, and wakes on
//! publish, settle, subscribe, or a link transition.

pub mod slot;

pub use slot::{Delivery, Subscription};

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::ticket::{DeliveryTicket, TicketState};
use crate::store::QueueStore;
use crate::transport::{ConnectionState, Transport};
use crate::utils::error::Result;

pub struct Dispatcher {
    store: Arc<QueueStore>,
    prefetch: AtomicUsize,
    next_ticket: AtomicU64,
    wake: Notify,
    inner: Mutex<DispatchInner>,
}

#[derive(Default)]
struct DispatchInner {
    rings: HashMap<String, ConsumerRing>,
    tickets: HashMap<u64, TicketEntry>,
}

/// Consumer slots of one queue plus the round-robin cursor.
#[derive(Default)]
struct ConsumerRing {
    slots: Vec<Slot>,
    cursor: usize,
}

struct Slot {
    consumer_id: Uuid,
    tx: mpsc::UnboundedSender<Delivery>,
    outstanding: usize,
}

struct TicketEntry {
    ticket: DeliveryTicket,
    state: TicketState,
}

impl Dispatcher {
    pub(crate) fn new(store: Arc<QueueStore>, prefetch: usize) -> Self {
        Self {
            store,
            prefetch: AtomicUsize::new(prefetch),
            next_ticket: AtomicU64::new(0),
            wake: Notify::new(),
            inner: Mutex::new(DispatchInner::default()),
        }
    }

    pub(crate) fn set_prefetch(&self, n: usize) {
        self.prefetch.store(n, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch.load(Ordering::SeqCst)
    }

    /// Wake the dispatch loop; called after anything that may unblock it.
    pub(crate) fn notify(&self) {
        self.wake.notify_one();
    }

    /// Adds a consumer slot for `queue` and returns its pull handle.
    pub(crate) fn register(this: &Arc<Self>, queue: &str) -> Subscription {
        let consumer_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = this.inner.lock().unwrap();
            inner
                .rings
                .entry(queue.to_string())
                .or_default()
                .slots
                .push(Slot {
                    consumer_id,
                    tx,
                    outstanding: 0,
                });
        }
        debug!(queue, %consumer_id, "consumer registered");
        this.wake.notify_one();
        Subscription::new(consumer_id, rx, Arc::clone(this))
    }

    /// Removes a consumer slot; its open tickets are requeued.
    pub(crate) fn deregister(&self, consumer_id: Uuid) {
        let orphaned: Vec<u64> = {
            let mut inner = self.inner.lock().unwrap();
            for ring in inner.rings.values_mut() {
                ring.slots.retain(|s| s.consumer_id != consumer_id);
            }
            inner
                .tickets
                .iter()
                .filter(|(_, e)| e.ticket.consumer_id == consumer_id)
                .map(|(id, _)| *id)
                .collect()
        };
        for ticket_id in orphaned {
            if let Err(e) = self.nack(ticket_id, true) {
                warn!(ticket = ticket_id, error = %e, "failed to requeue orphaned delivery");
            }
        }
        self.wake.notify_one();
    }

    /// Closes a ticket as acknowledged: the message is removed permanently.
    /// Settling an already-closed ticket is a no-op.
    pub fn ack(&self, ticket_id: u64) -> Result<()> {
        let Some(entry) = self.take_ticket(ticket_id) else {
            return Ok(());
        };
        self.store.remove(&entry.ticket.queue, entry.ticket.message_id)?;
        debug!(
            ticket = ticket_id,
            message = entry.ticket.message_id,
            state = ?TicketState::Acked,
            "ticket settled"
        );
        self.wake.notify_one();
        Ok(())
    }

    /// Closes a ticket as rejected. With `requeue` the message returns to
    /// the tail with its delivery count incremented; without it the message
    /// is dropped permanently. No-op on an already-closed ticket.
    pub fn nack(&self, ticket_id: u64, requeue: bool) -> Result<()> {
        let Some(entry) = self.take_ticket(ticket_id) else {
            return Ok(());
        };
        if requeue {
            self.store.requeue(&entry.ticket.queue, entry.ticket.message_id)?;
        } else {
            self.store.remove(&entry.ticket.queue, entry.ticket.message_id)?;
        }
        debug!(
            ticket = ticket_id,
            message = entry.ticket.message_id,
            state = ?TicketState::Requeued,
            requeue,
            "ticket settled"
        );
        self.wake.notify_one();
        Ok(())
    }

    /// Open (delivered, unsettled) tickets currently held by `consumer_id`.
    pub fn open_tickets(&self, consumer_id: Uuid) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .tickets
            .values()
            .filter(|e| e.state == TicketState::Delivered && e.ticket.consumer_id == consumer_id)
            .count()
    }

    fn take_ticket(&self, ticket_id: u64) -> Option<TicketEntry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.tickets.remove(&ticket_id)?;
        Self::credit_slot(&mut inner, &entry);
        Some(entry)
    }

    fn credit_slot(inner: &mut DispatchInner, entry: &TicketEntry) {
        if let Some(ring) = inner.rings.get_mut(&entry.ticket.queue) {
            if let Some(slot) = ring
                .slots
                .iter_mut()
                .find(|s| s.consumer_id == entry.ticket.consumer_id)
            {
                slot.outstanding = slot.outstanding.saturating_sub(1);
            }
        }
    }

    /// One pass over every queue: fill spare slot capacity round-robin.
    /// Returns how many deliveries were handed out.
    fn dispatch_once(this: &Arc<Self>) -> usize {
        let prefetch = this.prefetch();
        let mut dispatched = 0;
        let mut inner = this.inner.lock().unwrap();
        let queues: Vec<String> = inner.rings.keys().cloned().collect();
        for queue in queues {
            loop {
                let Some(ring) = inner.rings.get_mut(&queue) else {
                    break;
                };
                let n = ring.slots.len();
                if n == 0 {
                    break;
                }
                let mut chosen = None;
                for i in 0..n {
                    let idx = (ring.cursor + i) % n;
                    if ring.slots[idx].outstanding < prefetch {
                        chosen = Some(idx);
                        break;
                    }
                }
                let Some(idx) = chosen else {
                    break;
                };
                let Some(message) = this.store.reserve_next(&queue) else {
                    break;
                };
                ring.cursor = (idx + 1) % n;
                let ticket_id = this.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
                let mut entry = TicketEntry {
                    ticket: DeliveryTicket {
                        ticket_id,
                        message_id: message.id,
                        queue: queue.clone(),
                        consumer_id: ring.slots[idx].consumer_id,
                        delivered_at: Instant::now(),
                    },
                    state: TicketState::Pending,
                };
                let delivery = Delivery::new(message, ticket_id, Arc::clone(this));
                let slot = &mut ring.slots[idx];
                if slot.tx.send(delivery).is_err() {
                    // Receiver dropped: put the message back, retire the slot
                    this.store.release(&queue, entry.ticket.message_id);
                    let dead = slot.consumer_id;
                    ring.slots.retain(|s| s.consumer_id != dead);
                    continue;
                }
                slot.outstanding += 1;
                entry.state = TicketState::Delivered;
                debug!(
                    ticket = ticket_id,
                    message = entry.ticket.message_id,
                    queue = %queue,
                    consumer = %entry.ticket.consumer_id,
                    "delivered"
                );
                inner.tickets.insert(ticket_id, entry);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Force-nack tickets whose consumer has held them longer than `timeout`.
    fn expire_stale(&self, timeout: Duration) {
        let stale: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .tickets
                .iter()
                .filter(|(_, e)| e.ticket.delivered_at.elapsed() >= timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for ticket_id in stale {
            warn!(ticket = ticket_id, "delivery timed out; requeueing");
            if let Err(e) = self.nack(ticket_id, true) {
                warn!(ticket = ticket_id, error = %e, "failed to requeue timed-out delivery");
            }
        }
    }

    fn earliest_deadline(&self, timeout: Duration) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner
            .tickets
            .values()
            .map(|e| e.ticket.delivered_at + timeout)
            .min()
    }

    /// Link dropped: every open ticket is invalidated and its message
    /// released in place, so redelivery after reconnect keeps queue order.
    fn invalidate_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        let tickets: Vec<TicketEntry> = inner.tickets.drain().map(|(_, e)| e).collect();
        for entry in &tickets {
            self.store.release(&entry.ticket.queue, entry.ticket.message_id);
        }
        for ring in inner.rings.values_mut() {
            for slot in ring.slots.iter_mut() {
                slot.outstanding = 0;
            }
        }
        if !tickets.is_empty() {
            warn!(count = tickets.len(), "open deliveries invalidated by link drop");
        }
    }

    /// Channel close: every open ticket is nacked (requeued) and all slots
    /// are dropped, which ends their subscriptions.
    pub(crate) fn close(&self) {
        let tickets: Vec<TicketEntry> = {
            let mut inner = self.inner.lock().unwrap();
            let tickets = inner.tickets.drain().map(|(_, e)| e).collect();
            inner.rings.clear();
            tickets
        };
        for entry in tickets {
            if let Err(e) = self.store.requeue(&entry.ticket.queue, entry.ticket.message_id) {
                warn!(message = entry.ticket.message_id, error = %e, "failed to requeue on close");
            }
        }
        self.wake.notify_one();
    }

    /// The channel's dispatch loop. Suspends while the transport is away,
    /// while every slot is full, or while the queues are empty; resumes on
    /// any of those events. Exits on shutdown or transport close.
    pub(crate) async fn run(
        self: Arc<Self>,
        transport: Arc<Transport>,
        mut shutdown: watch::Receiver<bool>,
        delivery_timeout: Option<Duration>,
    ) {
        let mut link = transport.subscribe();
        let mut was_connected = matches!(*link.borrow(), ConnectionState::Connected);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let state = *link.borrow_and_update();
            match state {
                ConnectionState::Closing | ConnectionState::Closed => break,
                ConnectionState::Connected => {
                    was_connected = true;
                    if let Some(t) = delivery_timeout {
                        self.expire_stale(t);
                    }
                    let dispatched = Self::dispatch_once(&self);
                    if dispatched == 0 {
                        let deadline = delivery_timeout.and_then(|t| self.earliest_deadline(t));
                        tokio::select! {
                            _ = self.wake.notified() => {}
                            res = link.changed() => {
                                if res.is_err() {
                                    break;
                                }
                            }
                            res = shutdown.changed() => {
                                if res.is_err() {
                                    break;
                                }
                            }
                            _ = sleep_until_deadline(deadline) => {}
                        }
                    }
                }
                _ => {
                    if was_connected {
                        was_connected = false;
                        self.invalidate_open();
                    }
                    tokio::select! {
                        res = link.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("dispatch loop stopped");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}
