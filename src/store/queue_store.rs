use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use sled::Db;
use tracing::{debug, warn};

use crate::store::message::Message;
use crate::utils::error::{Error, Result};

const REGISTRY_TREE: &str = "__queues";

fn tree_name(queue: &str) -> String {
    format!("q:{queue}")
}

/// Durable, ordered message storage with at-least-once semantics.
///
/// Each queue is a FIFO sequence keyed by a monotonic sequence number.
/// Durable queues write through to a sled tree so their contents survive a
/// restart of the store. In-flight markers live only in memory: after a
/// restart every stored message is a dequeue candidate again, which is
/// where duplicate deliveries can come from.
///
/// All mutations happen under a single mutex, so appends are atomic and
/// enqueue order equals storage order.
pub struct QueueStore {
    db: Option<Db>,
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    queues: HashMap<String, QueueState>,
    next_seq: u64,
}

struct QueueState {
    durable: bool,
    /// (storage sequence, message), FIFO by sequence.
    entries: VecDeque<(u64, Message)>,
    /// Message ids with an open delivery; never re-dispatched while here.
    in_flight: HashSet<u64>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            entries: VecDeque::new(),
            in_flight: HashSet::new(),
        }
    }
}

impl QueueStore {
    /// Opens a store backed by a sled database at `path`, reloading every
    /// durable queue that was declared before the last shutdown.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let mut inner = StoreInner::default();

        let registry = db.open_tree(REGISTRY_TREE)?;
        for item in registry.iter() {
            let (key, _) = item?;
            let name = String::from_utf8_lossy(&key).into_owned();
            let mut state = QueueState::new(true);

            let tree = db.open_tree(tree_name(&name))?;
            for entry in tree.iter() {
                let (k, v) = entry?;
                if k.len() != 8 {
                    warn!(queue = %name, "skipping entry with malformed key");
                    continue;
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&k);
                let seq = u64::from_be_bytes(buf);
                let msg: Message = serde_json::from_slice(&v)?;
                inner.next_seq = inner.next_seq.max(seq);
                state.entries.push_back((seq, msg));
            }
            debug!(queue = %name, depth = state.entries.len(), "reloaded durable queue");
            inner.queues.insert(name, state);
        }

        Ok(Self {
            db: Some(db),
            inner: Mutex::new(inner),
        })
    }

    /// A store with no backing database. Queues declared durable here do
    /// not survive anything; intended for tests and transient setups.
    pub fn in_memory() -> Self {
        Self {
            db: None,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Declares a queue. Idempotent for identical durability; a conflicting
    /// redeclaration fails and leaves the existing queue untouched.
    pub fn declare(&self, name: &str, durable: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.queues.get(name) {
            if state.durable != durable {
                return Err(Error::QueueConflict {
                    name: name.to_string(),
                    existing: state.durable,
                });
            }
            return Ok(());
        }
        if durable {
            if let Some(db) = &self.db {
                let registry = db.open_tree(REGISTRY_TREE)?;
                registry.insert(name.as_bytes(), vec![1u8])?;
            }
        }
        inner.queues.insert(name.to_string(), QueueState::new(durable));
        debug!(queue = name, durable, "declared queue");
        Ok(())
    }

    /// Whether `name` has been declared, and with which durability.
    pub fn declared(&self, name: &str) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(name).map(|s| s.durable)
    }

    /// Appends a message at the tail and returns its id. For durable queues
    /// the entry is written through to sled before this returns; with
    /// `persistent` the write is also flushed, so a successful return means
    /// the message survives a crash of the store.
    pub fn enqueue(&self, queue: &str, payload: Vec<u8>, persistent: bool) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let msg = Message::new(seq, payload, persistent);

        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        if state.durable {
            if let Some(db) = &self.db {
                let tree = db.open_tree(tree_name(queue))?;
                tree.insert(seq.to_be_bytes(), serde_json::to_vec(&msg)?)?;
                if persistent {
                    db.flush()?;
                }
            }
        }
        state.entries.push_back((seq, msg));
        debug!(queue, id = seq, "enqueued message");
        Ok(seq)
    }

    /// Peeks at the first message with no open delivery. Non-destructive:
    /// the scan restarts from the head every time and nothing is removed
    /// until an ack.
    pub fn dequeue_candidate(&self, queue: &str) -> Option<Message> {
        let inner = self.inner.lock().unwrap();
        let state = inner.queues.get(queue)?;
        state
            .entries
            .iter()
            .find(|(_, m)| !state.in_flight.contains(&m.id))
            .map(|(_, m)| m.clone())
    }

    /// Atomically takes the next candidate and marks it in flight.
    pub fn reserve_next(&self, queue: &str) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.queues.get_mut(queue)?;
        let msg = state
            .entries
            .iter()
            .find(|(_, m)| !state.in_flight.contains(&m.id))
            .map(|(_, m)| m.clone())?;
        state.in_flight.insert(msg.id);
        Some(msg)
    }

    /// Marks a stored message as delivered. Returns false if the message is
    /// unknown or already in flight.
    pub fn mark_delivered(&self, queue: &str, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.queues.get_mut(queue) else {
            return false;
        };
        if !state.entries.iter().any(|(_, m)| m.id == id) {
            return false;
        }
        state.in_flight.insert(id)
    }

    /// Clears the in-flight marker without touching the entry. The message
    /// keeps its position, so redelivery preserves FIFO order. Used when a
    /// transport drop invalidates open deliveries.
    pub fn release(&self, queue: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.queues.get_mut(queue) {
            state.in_flight.remove(&id);
        }
    }

    /// Destroys a message after its delivery was acknowledged. A second
    /// remove of the same id is a no-op.
    pub fn remove(&self, queue: &str, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(());
        };
        state.in_flight.remove(&id);
        let Some(pos) = state.entries.iter().position(|(_, m)| m.id == id) else {
            return Ok(());
        };
        let durable = state.durable;
        let (seq, _) = state.entries.remove(pos).expect("position just found");
        if durable {
            if let Some(db) = &self.db {
                db.open_tree(tree_name(queue))?.remove(seq.to_be_bytes())?;
            }
        }
        debug!(queue, id, "removed message");
        Ok(())
    }

    /// Moves a message to the tail with `delivery_count` incremented. The
    /// id is preserved; only the storage position changes. No-op if the
    /// message is gone already.
    pub fn requeue(&self, queue: &str, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let new_seq = inner.next_seq;

        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(());
        };
        state.in_flight.remove(&id);
        let Some(pos) = state.entries.iter().position(|(_, m)| m.id == id) else {
            return Ok(());
        };
        let (old_seq, mut msg) = state.entries.remove(pos).expect("position just found");
        msg.delivery_count += 1;
        if state.durable {
            if let Some(db) = &self.db {
                let tree = db.open_tree(tree_name(queue))?;
                tree.remove(old_seq.to_be_bytes())?;
                tree.insert(new_seq.to_be_bytes(), serde_json::to_vec(&msg)?)?;
                if msg.persistent {
                    db.flush()?;
                }
            }
        }
        debug!(queue, id, delivery_count = msg.delivery_count, "requeued message");
        state.entries.push_back((new_seq, msg));
        Ok(())
    }

    /// Number of stored messages, delivered or not.
    pub fn depth(&self, queue: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(queue).map_or(0, |s| s.entries.len())
    }

    /// Number of messages currently marked in flight.
    pub fn in_flight(&self, queue: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(queue).map_or(0, |s| s.in_flight.len())
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("backed", &self.db.is_some())
            .finish()
    }
}
