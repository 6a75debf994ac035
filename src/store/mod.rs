//! The `store` module provides durable, ordered message storage.
//!
//! Messages are held in FIFO order per queue and removed only when a
//! delivery is acknowledged. Durable queues write through to `sled`, so
//! their contents survive a restart of the storage component.

pub mod message;
pub mod queue_store;

pub use message::Message;
pub use queue_store::QueueStore;
