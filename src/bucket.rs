//! Buckets and the bucket registry
//!
//! A bucket owns one store engine (one file), its partitions, and the
//! bucket-level subscriber list that gets wired into every partition's
//! observer, present and future. The registry maps names to buckets and
//! can reload them from the data directory at boot.

use crate::observer::Mutation;
use crate::store::{BucketStore, MemoryOnly, StoreOptions, StoreStats, COLL_SUFFIX_ITEMS};
use crate::vbucket::{VBState, VBucket};
use crate::{Result, StoreError, MAX_VBUCKETS};
use crossbeam::channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SETTINGS_FILE: &str = "settings.json";
const STORE_FILE: &str = "data.store";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Fixed at bucket creation
    pub num_partitions: u16,

    /// Max key+value bytes per item; advisory, enforced at the dispatch
    /// boundary
    pub quota_bytes: u64,

    pub memory_only: MemoryOnly,

    pub flush_interval_ms: u64,
}

impl Default for BucketSettings {
    fn default() -> Self {
        BucketSettings {
            num_partitions: 1,
            quota_bytes: 1_000_000,
            memory_only: MemoryOnly::Persisted,
            flush_interval_ms: 10_000,
        }
    }
}

impl BucketSettings {
    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            memory_only: self.memory_only,
        }
    }
}

pub struct Bucket {
    dir: PathBuf,
    settings: BucketSettings,
    store: Arc<BucketStore>,
    vbuckets: RwLock<HashMap<u16, Arc<VBucket>>>,
    subscribers: RwLock<Vec<Sender<Mutation>>>,
    cas_counter: Arc<AtomicU64>,
}

impl Bucket {
    /// Open or create a bucket directory. Settings already on disk win over
    /// the ones passed in; partitions are rediscovered from the store's
    /// collection names and self-healed against the change log.
    pub fn open(dir: impl Into<PathBuf>, settings: &BucketSettings) -> Result<Bucket> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let settings_path = dir.join(SETTINGS_FILE);
        let settings = if settings_path.exists() {
            let raw = fs::read_to_string(&settings_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corruption(format!("bad bucket settings: {}", e)))?
        } else {
            let settings = settings.clone();
            let raw = serde_json::to_string_pretty(&settings)
                .map_err(|e| StoreError::Corruption(format!("bad bucket settings: {}", e)))?;
            fs::write(&settings_path, raw)?;
            settings
        };

        let store = Arc::new(BucketStore::open(
            dir.join(STORE_FILE),
            settings.store_options(),
        )?);
        let cas_counter = Arc::new(AtomicU64::new(store.max_cas()?));

        let mut vbuckets = HashMap::new();
        for name in store.collection_names()? {
            let Some(id) = name
                .strip_suffix(COLL_SUFFIX_ITEMS)
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let vb = Arc::new(VBucket::new(
                id,
                Arc::clone(&store),
                Arc::clone(&cas_counter),
            )?);
            let healed = store.reconcile(vb.colls())?;
            if healed > 0 {
                warn!(vbucket = id, healed, "dropped dangling key-index rows");
            }
            vbuckets.insert(id, vb);
        }

        Ok(Bucket {
            dir,
            settings,
            store,
            vbuckets: RwLock::new(vbuckets),
            subscribers: RwLock::new(Vec::new()),
            cas_counter,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Get-or-create a partition. Fresh partitions start `Dead` and pick up
    /// every bucket-level subscriber.
    pub fn create_vbucket(&self, id: u16) -> Result<Arc<VBucket>> {
        if id >= self.settings.num_partitions || id >= MAX_VBUCKETS {
            return Err(StoreError::Protocol(format!(
                "partition {} out of range",
                id
            )));
        }
        if let Some(vb) = self.vbucket(id) {
            return Ok(vb);
        }
        let vb = Arc::new(VBucket::new(
            id,
            Arc::clone(&self.store),
            Arc::clone(&self.cas_counter),
        )?);
        // Hold the subscriber list across the insert so a concurrent
        // subscribe() cannot miss this partition (lock order: subscribers,
        // then vbuckets)
        let subs = self.subscribers.read();
        for sub in subs.iter() {
            vb.observer.subscribe(sub.clone());
        }
        self.vbuckets.write().insert(id, Arc::clone(&vb));
        drop(subs);
        Ok(vb)
    }

    pub fn vbucket(&self, id: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.read().get(&id).cloned()
    }

    /// Partitions in id order.
    pub fn vbuckets(&self) -> Vec<Arc<VBucket>> {
        let mut vbs: Vec<_> = self.vbuckets.read().values().cloned().collect();
        vbs.sort_by_key(|vb| vb.id());
        vbs
    }

    pub fn set_vb_state(&self, id: u16, state: VBState) -> Option<VBState> {
        self.vbucket(id).map(|vb| vb.set_state(state))
    }

    /// Drop the partition and both of its collections.
    pub fn destroy_vbucket(&self, id: u16) -> Result<bool> {
        let Some(vb) = self.vbuckets.write().remove(&id) else {
            return Ok(false);
        };
        self.store.remove_collection_pair(vb.colls())?;
        Ok(true)
    }

    /// Register a delivery target on every current and future partition.
    pub fn subscribe(&self, inbox: Sender<Mutation>) {
        let mut subs = self.subscribers.write();
        for vb in self.vbuckets.read().values() {
            vb.observer.subscribe(inbox.clone());
        }
        subs.push(inbox);
    }

    /// Flush the shared engine; all partitions ride along.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn close(&self) {
        self.store.close();
    }
}

pub struct Buckets {
    dir: PathBuf,
    default_settings: BucketSettings,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl Buckets {
    pub fn new(dir: impl Into<PathBuf>, default_settings: BucketSettings) -> Result<Buckets> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Buckets {
            dir,
            default_settings,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_settings(&self) -> &BucketSettings {
        &self.default_settings
    }

    pub fn create(&self, name: &str) -> Result<Arc<Bucket>> {
        self.create_with(name, self.default_settings.clone())
    }

    pub fn create_with(&self, name: &str, settings: BucketSettings) -> Result<Arc<Bucket>> {
        if self.buckets.read().contains_key(name) {
            return Err(StoreError::BucketExists(name.to_string()));
        }
        let bucket = Arc::new(Bucket::open(self.dir.join(name), &settings)?);
        self.buckets
            .write()
            .insert(name.to_string(), Arc::clone(&bucket));
        Ok(bucket)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.buckets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Load every bucket directory under the data dir. Returns how many
    /// were opened.
    pub fn load(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(SETTINGS_FILE).exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.buckets.read().contains_key(name) {
                continue;
            }
            info!(bucket = name, "loading bucket");
            let bucket = Arc::new(Bucket::open(&path, &self.default_settings)?);
            self.buckets.write().insert(name.to_string(), bucket);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Close the bucket and optionally delete its directory.
    pub fn destroy(&self, name: &str, delete_files: bool) -> Result<()> {
        let Some(bucket) = self.buckets.write().remove(name) else {
            return Err(StoreError::NoSuchBucket(name.to_string()));
        };
        bucket.close();
        if delete_files {
            fs::remove_dir_all(bucket.dir())?;
        }
        Ok(())
    }

    pub fn close_all(&self) {
        for bucket in self.buckets.read().values() {
            bucket.close();
        }
    }
}
