//! Mutation fan-out
//!
//! Every accepted mutation on a partition is submitted once and delivered
//! to each registered subscriber inbox. Delivery is best-effort: a full
//! inbox drops the event for that subscriber rather than stalling the
//! mutating path, and a disconnected subscriber is pruned on the next
//! submit.

use crate::Cas;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Default subscriber inbox depth
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// What happened, not what the value was. Consumers re-fetch by vbucket and
/// key; the value may already have moved on by delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub cas: Cas,
    pub deleted: bool,
}

#[derive(Default)]
pub struct MutationObserver {
    subs: RwLock<Vec<(u64, Sender<Mutation>)>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl MutationObserver {
    pub fn new() -> MutationObserver {
        MutationObserver::default()
    }

    /// Register a delivery target; returns a token for `unsubscribe`.
    pub fn subscribe(&self, inbox: Sender<Mutation>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.write().push((id, inbox));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subs.write().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Events dropped because a subscriber inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver to every current subscriber without ever blocking.
    pub fn submit(&self, mutation: Mutation) {
        let mut dead = Vec::new();
        {
            let subs = self.subs.read();
            for (id, inbox) in subs.iter() {
                match inbox.try_send(mutation.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            self.subs.write().retain(|(id, _)| !dead.contains(id));
        }
    }
}

/// Process-scoped mutation logger: one subscriber thread draining a bounded
/// inbox and tracing every event. Constructed at boot, handed to buckets by
/// reference, drained on drop.
pub struct MutationLogger {
    tx: Option<Sender<Mutation>>,
    handle: Option<JoinHandle<()>>,
}

impl MutationLogger {
    pub fn start(capacity: usize) -> MutationLogger {
        let (tx, rx): (Sender<Mutation>, Receiver<Mutation>) = channel::bounded(capacity);
        let handle = thread::spawn(move || {
            for m in rx {
                debug!(
                    vbucket = m.vbucket,
                    cas = m.cas,
                    deleted = m.deleted,
                    key = %String::from_utf8_lossy(&m.key),
                    "mutation"
                );
            }
        });
        MutationLogger {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Inbox to hand to `Bucket::subscribe`.
    pub fn sender(&self) -> Sender<Mutation> {
        self.tx.as_ref().expect("logger running").clone()
    }
}

impl Drop for MutationLogger {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
