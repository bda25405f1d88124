use bodega::store::{BucketStore, CollPair, StoreOptions};
use bodega::{Bucket, BucketSettings, Item, Result, VBState};
use crossbeam::channel;
use tempfile::tempdir;

fn open_bucket(dir: &std::path::Path) -> Result<Bucket> {
    Bucket::open(
        dir.join("b"),
        &BucketSettings {
            num_partitions: 4,
            ..BucketSettings::default()
        },
    )
}

#[test]
fn test_latest_mutation_wins_and_cas_increases() -> Result<()> {
    let dir = tempdir().unwrap();
    let bucket = open_bucket(dir.path())?;
    let vb = bucket.create_vbucket(0)?;
    vb.set_state(VBState::Active);

    let mut last_cas = 0;
    for value in [b"one".as_ref(), b"two", b"three"] {
        let item = vb.set(b"key", value, 0, 0)?;
        assert!(item.cas > last_cas);
        last_cas = item.cas;
    }
    let del_cas = vb.delete(b"key")?.unwrap();
    assert!(del_cas > last_cas);

    let item = vb.set(b"key", b"four", 0, 0)?;
    assert!(item.cas > del_cas);
    assert_eq!(vb.get(b"key")?.unwrap().value, Some(b"four".to_vec()));
    Ok(())
}

#[test]
fn test_write_then_read_without_flush() -> Result<()> {
    let dir = tempdir().unwrap();
    let bucket = open_bucket(dir.path())?;
    let vb = bucket.create_vbucket(0)?;

    vb.set(b"k", b"v", 0, 0)?;
    assert_eq!(vb.get(b"k")?.unwrap().value, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn test_delete_hides_key_but_change_log_keeps_tombstone() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = BucketStore::open(dir.path().join("data.store"), StoreOptions::default())?;
    let pair = store.collection_pair(0)?;

    store.set(&pair, &Item::new(b"k".to_vec(), b"v".to_vec(), 0, 0, 1))?;
    store.del(&pair, b"k", 2)?;

    assert_eq!(store.get(&pair, b"k")?, None);
    assert_eq!(store.get_meta(&pair, b"k")?, None);

    let (tx, rx) = channel::unbounded();
    store.visit_changes(&pair, None, true, move |c| {
        tx.send((c.cas, c.item.clone())).is_ok()
    })?;
    let changes: Vec<_> = rx.into_iter().collect();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].0, 1);
    assert!(changes[0].1.is_some());
    assert_eq!(changes[1].0, 2);
    assert!(changes[1].1.is_none());
    Ok(())
}

#[test]
fn test_double_flush_is_idempotent() -> Result<()> {
    let dir = tempdir().unwrap();
    let store = BucketStore::open(dir.path().join("data.store"), StoreOptions::default())?;
    let pair = store.collection_pair(0)?;
    store.set(&pair, &Item::new(b"k".to_vec(), b"v".to_vec(), 0, 0, 1))?;

    store.flush()?;
    assert_eq!(store.dirtiness(), 0);
    store.flush()?;
    assert_eq!(store.dirtiness(), 0);
    assert_eq!(store.stats().tot_flush, 2);
    Ok(())
}

#[test]
fn test_range_copy_preserves_range_and_order() -> Result<()> {
    let dir = tempdir().unwrap();
    let src = BucketStore::open(dir.path().join("src.store"), StoreOptions::default())?;
    let dst = BucketStore::open(dir.path().join("dst.store"), StoreOptions::default())?;
    let src_pair = src.collection_pair(0)?;
    let dst_pair = dst.collection_pair(0)?;

    let keys: Vec<&[u8]> = vec![b"apple", b"banana", b"cherry", b"damson", b"elder"];
    for (i, key) in keys.iter().enumerate() {
        src.set(
            &src_pair,
            &Item::new(key.to_vec(), key.to_vec(), 0, 0, (i + 1) as u64),
        )?;
    }

    src.range_copy(
        &src_pair.items,
        &dst,
        &dst_pair.items,
        Some(b"banana".to_vec()),
        Some(b"elder".to_vec()),
    )?;
    src.range_copy(&src_pair.changes, &dst, &dst_pair.changes, None, None)?;

    let (tx, rx) = channel::unbounded();
    dst.visit_items(&dst_pair, None, true, move |item| {
        tx.send(item.key.clone()).is_ok()
    })?;
    let copied: Vec<_> = rx.into_iter().collect();
    assert_eq!(
        copied,
        vec![b"banana".to_vec(), b"cherry".to_vec(), b"damson".to_vec()]
    );
    Ok(())
}

#[test]
fn test_items_survive_flush_and_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.store");
    {
        let store = BucketStore::open(&path, StoreOptions::default())?;
        let pair = store.collection_pair(0)?;
        store.set(&pair, &Item::new(b"k".to_vec(), b"v".to_vec(), 5, 0, 1))?;
        store.flush()?;
        store.close();
    }

    let store = BucketStore::open(&path, StoreOptions::default())?;
    let pair = CollPair::for_vbucket(0);
    let item = store.get(&pair, b"k")?.unwrap();
    assert_eq!(item.value, Some(b"v".to_vec()));
    assert_eq!(item.flags, 5);
    Ok(())
}

#[test]
fn test_unflushed_mutations_do_not_survive_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.store");
    {
        let store = BucketStore::open(&path, StoreOptions::default())?;
        let pair = store.collection_pair(0)?;
        store.set(&pair, &Item::new(b"durable".to_vec(), b"v".to_vec(), 0, 0, 1))?;
        store.flush()?;
        store.set(&pair, &Item::new(b"volatile".to_vec(), b"v".to_vec(), 0, 0, 2))?;
        store.close();
    }

    let store = BucketStore::open(&path, StoreOptions::default())?;
    let pair = CollPair::for_vbucket(0);
    assert!(store.get(&pair, b"durable")?.is_some());
    assert_eq!(store.get(&pair, b"volatile")?, None);
    Ok(())
}
