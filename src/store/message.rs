use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A queued message and its delivery bookkeeping.
///
/// The payload is immutable once enqueued. `id` is assigned by the store at
/// enqueue time and is preserved across requeues; `delivery_count` records
/// how many times the message has been handed back after a failed delivery.
///
/// This structure is serialized to JSON for durable storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Vec<u8>,
    pub enqueued_at: i64,
    pub persistent: bool,
    pub delivery_count: u32,
}

impl Message {
    pub fn new(id: u64, payload: Vec<u8>, persistent: bool) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now().timestamp_millis(),
            persistent,
            delivery_count: 0,
        }
    }

    /// Payload as UTF-8, lossy. Used by logs and the terminal demo.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
