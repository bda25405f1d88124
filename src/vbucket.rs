//! Partition (vbucket) handle and state machine
//!
//! A vbucket never owns storage; it holds its engine's collection pair,
//! its own mutation observer, and the bucket-wide cas counter. State gates
//! what callers and the tap feed will do with it, and is re-checked at use
//! time since the owner may flip it at any moment.

use crate::item::Item;
use crate::observer::{Mutation, MutationObserver};
use crate::store::{BucketStore, CollPair};
use crate::{Cas, Result};
use crossbeam::channel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VBState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl fmt::Display for VBState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VBState::Active => "active",
            VBState::Replica => "replica",
            VBState::Pending => "pending",
            VBState::Dead => "dead",
        };
        f.write_str(s)
    }
}

pub struct VBucket {
    id: u16,
    state: RwLock<VBState>,
    store: Arc<BucketStore>,
    colls: CollPair,
    cas_counter: Arc<AtomicU64>,
    pub observer: MutationObserver,
}

impl VBucket {
    /// Bind a partition to its engine collection pair. Fresh partitions
    /// start `Dead`; the owner activates them explicitly.
    pub fn new(id: u16, store: Arc<BucketStore>, cas_counter: Arc<AtomicU64>) -> Result<VBucket> {
        let colls = store.collection_pair(id)?;
        Ok(VBucket {
            id,
            state: RwLock::new(VBState::Dead),
            store,
            colls,
            cas_counter,
            observer: MutationObserver::new(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBState {
        *self.state.read()
    }

    /// Pure transition; returns the previous state. Callers re-check state
    /// before acting on it.
    pub fn set_state(&self, new: VBState) -> VBState {
        std::mem::replace(&mut *self.state.write(), new)
    }

    pub fn colls(&self) -> &CollPair {
        &self.colls
    }

    fn next_cas(&self) -> Cas {
        self.cas_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Item>> {
        self.store.get(&self.colls, key)
    }

    pub fn get_meta(&self, key: &[u8]) -> Result<Option<Item>> {
        self.store.get_meta(&self.colls, key)
    }

    /// Accept a mutation and submit exactly one observer event for it.
    pub fn set(&self, key: &[u8], value: &[u8], flags: u32, expiry: u32) -> Result<Item> {
        let item = Item::new(key.to_vec(), value.to_vec(), flags, expiry, self.next_cas());
        self.store.set(&self.colls, &item)?;
        self.observer.submit(Mutation {
            vbucket: self.id,
            key: item.key.clone(),
            cas: item.cas,
            deleted: false,
        });
        Ok(item)
    }

    /// Delete a key. Returns the tombstone cas, or None if the key was not
    /// present.
    pub fn delete(&self, key: &[u8]) -> Result<Option<Cas>> {
        if self.get_meta(key)?.is_none() {
            return Ok(None);
        }
        let cas = self.next_cas();
        self.store.del(&self.colls, key, cas)?;
        self.observer.submit(Mutation {
            vbucket: self.id,
            key: key.to_vec(),
            cas,
            deleted: true,
        });
        Ok(Some(cas))
    }

    /// Consistent ascending-key snapshot of the live items, for backfill.
    pub fn snapshot_items(&self) -> Result<Vec<Item>> {
        let (tx, rx) = channel::unbounded();
        self.store
            .visit_items(&self.colls, None, true, move |item| {
                tx.send(item.clone()).is_ok()
            })?;
        Ok(rx.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use tempfile::tempdir;

    fn test_vbucket(dir: &std::path::Path) -> VBucket {
        let store =
            Arc::new(BucketStore::open(dir.join("data.store"), StoreOptions::default()).unwrap());
        VBucket::new(0, store, Arc::new(AtomicU64::new(0))).unwrap()
    }

    #[test]
    fn test_set_assigns_increasing_cas_and_notifies() {
        let dir = tempdir().unwrap();
        let vb = test_vbucket(dir.path());
        let (tx, rx) = channel::bounded(8);
        vb.observer.subscribe(tx);

        let first = vb.set(b"k", b"v1", 0, 0).unwrap();
        let second = vb.set(b"k", b"v2", 0, 0).unwrap();
        assert!(second.cas > first.cas);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.cas, first.cas);
        assert!(!ev.deleted);
        assert_eq!(rx.try_recv().unwrap().cas, second.cas);

        assert_eq!(
            vb.get(b"k").unwrap().unwrap().value,
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_delete_notifies_with_tombstone_event() {
        let dir = tempdir().unwrap();
        let vb = test_vbucket(dir.path());
        vb.set(b"k", b"v", 0, 0).unwrap();

        let (tx, rx) = channel::bounded(8);
        vb.observer.subscribe(tx);

        let cas = vb.delete(b"k").unwrap().unwrap();
        let ev = rx.try_recv().unwrap();
        assert!(ev.deleted);
        assert_eq!(ev.cas, cas);
        assert_eq!(vb.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_key_is_a_miss_not_an_event() {
        let dir = tempdir().unwrap();
        let vb = test_vbucket(dir.path());
        let (tx, rx) = channel::bounded(8);
        vb.observer.subscribe(tx);

        assert_eq!(vb.delete(b"nope").unwrap(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_state_returns_previous() {
        let dir = tempdir().unwrap();
        let vb = test_vbucket(dir.path());
        assert_eq!(vb.state(), VBState::Dead);
        assert_eq!(vb.set_state(VBState::Active), VBState::Dead);
        assert_eq!(vb.state(), VBState::Active);
    }

    #[test]
    fn test_snapshot_items_is_key_ordered() {
        let dir = tempdir().unwrap();
        let vb = test_vbucket(dir.path());
        vb.set(b"2", b"200", 0, 0).unwrap();
        vb.set(b"1", b"100", 0, 0).unwrap();

        let items = vb.snapshot_items().unwrap();
        let keys: Vec<_> = items.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, vec![b"1".to_vec(), b"2".to_vec()]);
    }
}
