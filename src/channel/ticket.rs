use std::time::Instant;

use uuid::Uuid;

/// States a delivery ticket moves through. `Acked` and `Requeued` are
/// terminal; `Requeued` puts the message back at the tail of its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Pending,
    Delivered,
    Acked,
    Requeued,
}

/// Bookkeeping record of one in-flight, unacknowledged delivery.
///
/// A ticket exists from delivery until it is acked, nacked, timed out, or
/// invalidated by a link drop. The dispatcher uses it for prefetch
/// accounting; the channel owns its lifecycle.
#[derive(Debug, Clone)]
pub struct DeliveryTicket {
    pub ticket_id: u64,
    pub message_id: u64,
    pub queue: String,
    pub consumer_id: Uuid,
    pub delivered_at: Instant,
}
