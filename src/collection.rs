//! Named ordered collections over a single backing file
//!
//! The durable ordered-map primitive under the bucket store engine. Rows
//! live in ordered in-memory maps; `flush` serializes every non-transient
//! collection into a checksummed snapshot appended to the file and commits
//! it by rewriting one of two alternating header slots. Open picks the
//! highest-generation slot whose payload still checksums, so a torn flush
//! falls back to the previous snapshot.
//!
//! All raw file access goes through the `StoreFile` seam, which the engine
//! binds to its dedicated file-service loop.

use crate::{Result, StoreError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;

/// Raw file access contract consumed by the collection store.
///
/// `read_at` must return exactly `len` bytes or fail; `write_at` must write
/// the whole buffer.
pub trait StoreFile: Send {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize>;
    fn size(&self) -> io::Result<u64>;
}

const MAGIC: [u8; 8] = *b"BODEGAC1";
const FORMAT_VERSION: u32 = 1;

/// magic(8) version(4) reserved(4)
const PREFIX_LEN: usize = 16;
/// generation(8) offset(8) length(8) crc(4)
const SLOT_LEN: usize = 28;
const SLOT_BASE: u64 = PREFIX_LEN as u64;
/// Snapshot payloads start past the prefix and both slots
const HEADER_LEN: u64 = SLOT_BASE + 2 * SLOT_LEN as u64;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    collections: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>,
}

struct Collection {
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
    transient: bool,
}

pub struct CollectionStore {
    file: Box<dyn StoreFile>,
    colls: BTreeMap<String, Collection>,
    /// Next snapshot write offset; only grows
    tail: u64,
    generation: u64,
}

impl CollectionStore {
    /// Open an existing store or start a fresh one on an empty file.
    pub fn open(file: Box<dyn StoreFile>) -> Result<Self> {
        let size = file.size()?;
        if size < HEADER_LEN {
            // Empty or never-flushed file
            return Ok(CollectionStore {
                file,
                colls: BTreeMap::new(),
                tail: HEADER_LEN,
                generation: 0,
            });
        }

        let prefix = file.read_at(0, PREFIX_LEN)?;
        if prefix[..8] != MAGIC {
            return Err(StoreError::Corruption("bad store magic".to_string()));
        }
        let version = u32::from_be_bytes(prefix[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported store format version {}",
                version
            )));
        }

        let mut best: Option<(u64, Snapshot)> = None;
        for slot in 0..2u64 {
            let raw = file.read_at(SLOT_BASE + slot * SLOT_LEN as u64, SLOT_LEN)?;
            let mut buf = &raw[..];
            let generation = buf.get_u64();
            let offset = buf.get_u64();
            let length = buf.get_u64();
            let crc = buf.get_u32();
            if generation == 0 || length == 0 || offset + length > size {
                continue;
            }
            let payload = match file.read_at(offset, length as usize) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != crc {
                continue;
            }
            let snapshot: Snapshot = match bincode::deserialize(&payload) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if best.as_ref().map_or(true, |(g, _)| generation > *g) {
                best = Some((generation, snapshot));
            }
        }

        let (generation, colls) = match best {
            Some((generation, snapshot)) => {
                let colls = snapshot
                    .collections
                    .into_iter()
                    .map(|(name, rows)| {
                        (
                            name,
                            Collection {
                                rows: rows.into_iter().collect(),
                                transient: false,
                            },
                        )
                    })
                    .collect();
                (generation, colls)
            }
            // Crash before the first commit: nothing durable yet
            None => (0, BTreeMap::new()),
        };

        Ok(CollectionStore {
            file,
            colls,
            tail: size.max(HEADER_LEN),
            generation,
        })
    }

    /// Persist every non-transient collection.
    ///
    /// The payload is written first and the header slot last, so the
    /// previous snapshot stays valid until the new one is fully committed.
    pub fn flush(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            collections: self
                .colls
                .iter()
                .filter(|(_, c)| !c.transient)
                .map(|(name, c)| {
                    (
                        name.clone(),
                        c.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    )
                })
                .collect(),
        };
        let payload = bincode::serialize(&snapshot)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let offset = self.tail;
        self.file.write_at(offset, &payload)?;

        let mut prefix = BytesMut::with_capacity(PREFIX_LEN);
        prefix.put_slice(&MAGIC);
        prefix.put_u32(FORMAT_VERSION);
        prefix.put_u32(0);
        self.file.write_at(0, &prefix)?;

        let generation = self.generation + 1;
        let mut slot = BytesMut::with_capacity(SLOT_LEN);
        slot.put_u64(generation);
        slot.put_u64(offset);
        slot.put_u64(payload.len() as u64);
        slot.put_u32(crc);
        self.file
            .write_at(SLOT_BASE + (generation % 2) * SLOT_LEN as u64, &slot)?;

        self.generation = generation;
        self.tail = offset + payload.len() as u64;
        Ok(())
    }

    /// Create the collection if absent; idempotent. A transient collection
    /// is never written to disk.
    pub fn ensure_collection(&mut self, name: &str, transient: bool) {
        self.colls.entry(name.to_string()).or_insert(Collection {
            rows: BTreeMap::new(),
            transient,
        });
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.colls.contains_key(name)
    }

    pub fn remove_collection(&mut self, name: &str) -> bool {
        self.colls.remove(name).is_some()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.colls.keys().cloned().collect()
    }

    fn coll(&self, name: &str) -> Result<&Collection> {
        self.colls
            .get(name)
            .ok_or_else(|| StoreError::NoSuchCollection(name.to_string()))
    }

    fn coll_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.colls
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchCollection(name.to_string()))
    }

    pub fn get(&self, coll: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.coll(coll)?.rows.get(key).cloned())
    }

    pub fn set(&mut self, coll: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.coll_mut(coll)?.rows.insert(key, value);
        Ok(())
    }

    pub fn delete(&mut self, coll: &str, key: &[u8]) -> Result<bool> {
        Ok(self.coll_mut(coll)?.rows.remove(key).is_some())
    }

    pub fn min_key(&self, coll: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.coll(coll)?.rows.keys().next().cloned())
    }

    pub fn max_key(&self, coll: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.coll(coll)?.rows.keys().next_back().cloned())
    }

    /// Ascending traversal from `start` (inclusive). The visitor returning
    /// false stops the walk.
    pub fn visit_ascend<F>(&self, coll: &str, start: &[u8], mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        for (k, v) in self
            .coll(coll)?
            .rows
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
        {
            if !visitor(k, v) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory StoreFile for exercising snapshot logic without disk.
    #[derive(Clone, Default)]
    struct MemFile(Arc<Mutex<Vec<u8>>>);

    impl StoreFile for MemFile {
        fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
            let data = self.0.lock();
            let start = offset as usize;
            if start + len > data.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
            }
            Ok(data[start..start + len].to_vec())
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
            let mut data = self.0.lock();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn size(&self) -> io::Result<u64> {
            Ok(self.0.lock().len() as u64)
        }
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let store = CollectionStore::open(Box::new(MemFile::default())).unwrap();
        assert!(store.collection_names().is_empty());
    }

    #[test]
    fn test_flush_and_reopen() {
        let file = MemFile::default();
        let mut store = CollectionStore::open(Box::new(file.clone())).unwrap();
        store.ensure_collection("c", false);
        store.set("c", b"a".to_vec(), b"1".to_vec()).unwrap();
        store.set("c", b"b".to_vec(), b"2".to_vec()).unwrap();
        store.flush().unwrap();

        let reopened = CollectionStore::open(Box::new(file)).unwrap();
        assert_eq!(reopened.get("c", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.get("c", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_second_flush_supersedes_first() {
        let file = MemFile::default();
        let mut store = CollectionStore::open(Box::new(file.clone())).unwrap();
        store.ensure_collection("c", false);
        store.set("c", b"k".to_vec(), b"old".to_vec()).unwrap();
        store.flush().unwrap();
        store.set("c", b"k".to_vec(), b"new".to_vec()).unwrap();
        store.flush().unwrap();

        let reopened = CollectionStore::open(Box::new(file)).unwrap();
        assert_eq!(reopened.get("c", b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_torn_commit_falls_back_to_previous_snapshot() {
        let file = MemFile::default();
        let mut store = CollectionStore::open(Box::new(file.clone())).unwrap();
        store.ensure_collection("c", false);
        store.set("c", b"k".to_vec(), b"good".to_vec()).unwrap();
        store.flush().unwrap();
        store.set("c", b"k".to_vec(), b"torn".to_vec()).unwrap();
        store.flush().unwrap();

        // Corrupt the newest snapshot payload; the slot crc no longer
        // matches and open must fall back to generation 1.
        {
            let mut data = file.0.lock();
            let last = data.len() - 1;
            data[last] ^= 0xff;
        }
        let reopened = CollectionStore::open(Box::new(file)).unwrap();
        assert_eq!(reopened.get("c", b"k").unwrap(), Some(b"good".to_vec()));
    }

    #[test]
    fn test_transient_collection_not_persisted() {
        let file = MemFile::default();
        let mut store = CollectionStore::open(Box::new(file.clone())).unwrap();
        store.ensure_collection("mem", true);
        store.ensure_collection("disk", false);
        store.set("mem", b"k".to_vec(), b"v".to_vec()).unwrap();
        store.set("disk", b"k".to_vec(), b"v".to_vec()).unwrap();
        store.flush().unwrap();

        let reopened = CollectionStore::open(Box::new(file)).unwrap();
        assert!(!reopened.has_collection("mem"));
        assert!(reopened.has_collection("disk"));
    }

    #[test]
    fn test_visit_ascend_with_early_stop() {
        let mut store = CollectionStore::open(Box::new(MemFile::default())).unwrap();
        store.ensure_collection("c", false);
        for k in [b"a", b"b", b"c", b"d"] {
            store.set("c", k.to_vec(), k.to_vec()).unwrap();
        }
        let mut seen = Vec::new();
        store
            .visit_ascend("c", b"b", |k, _| {
                seen.push(k.to_vec());
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_missing_collection_is_an_error() {
        let store = CollectionStore::open(Box::new(MemFile::default())).unwrap();
        assert!(matches!(
            store.get("nope", b"k"),
            Err(StoreError::NoSuchCollection(_))
        ));
    }
}
