#![cfg(feature = "memory")]

use cinder_store::{Durability, MemoryStore, Store, StoreError, Transaction};

fn seeded(n: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let txn = store.begin(false).unwrap();
    for i in 0..n {
        txn.put(format!("key{i:03}").as_bytes(), format!("value{i}").as_bytes())
            .unwrap();
    }
    txn.commit(Durability::Buffered).unwrap();
    store
}

#[test]
fn put_and_get() {
    let store = MemoryStore::new();
    let txn = store.begin(false).unwrap();
    txn.put(b"key1", b"value1").unwrap();
    txn.commit(Durability::Buffered).unwrap();

    let txn = store.begin(true).unwrap();
    assert_eq!(txn.get(b"key1").unwrap().unwrap(), b"value1");
}

#[test]
fn get_missing_key_returns_none() {
    let store = MemoryStore::new();
    let txn = store.begin(true).unwrap();
    assert!(txn.get(b"nonexistent").unwrap().is_none());
}

#[test]
fn put_and_delete() {
    let store = seeded(1);
    let txn = store.begin(false).unwrap();
    txn.delete(b"key000").unwrap();
    txn.commit(Durability::Buffered).unwrap();

    let txn = store.begin(true).unwrap();
    assert!(txn.get(b"key000").unwrap().is_none());
    assert!(store.is_empty());
}

#[test]
fn reads_see_own_writes() {
    let store = MemoryStore::new();
    let txn = store.begin(false).unwrap();
    txn.put(b"a", b"1").unwrap();
    assert_eq!(txn.get(b"a").unwrap().unwrap(), b"1");
    txn.delete(b"a").unwrap();
    assert!(txn.get(b"a").unwrap().is_none());
}

#[test]
fn uncommitted_writes_are_invisible() {
    let store = seeded(2);
    let writer = store.begin(false).unwrap();
    writer.put(b"key999", b"late").unwrap();

    let reader = store.begin(true).unwrap();
    assert!(reader.get(b"key999").unwrap().is_none());
    assert_eq!(store.len(), 2);
    writer.rollback().unwrap();
    assert_eq!(store.len(), 2);
}

#[test]
fn snapshot_isolated_from_later_commits() {
    let store = seeded(3);
    let reader = store.begin(true).unwrap();

    let writer = store.begin(false).unwrap();
    writer.delete(b"key000").unwrap();
    writer.commit(Durability::Buffered).unwrap();

    assert!(reader.get(b"key000").unwrap().is_some());
    assert_eq!(reader.scan().unwrap().count(), 3);
    assert_eq!(store.len(), 2);
}

#[test]
fn scan_returns_keys_in_order() {
    let store = seeded(5);
    let txn = store.begin(true).unwrap();
    let keys: Vec<Vec<u8>> = txn.scan().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(
        keys,
        vec![
            b"key000".to_vec(),
            b"key001".to_vec(),
            b"key002".to_vec(),
            b"key003".to_vec(),
            b"key004".to_vec(),
        ]
    );
}

#[test]
fn scan_while_deleting() {
    let store = seeded(10);
    let txn = store.begin(false).unwrap();
    let entries: Vec<_> = txn.scan().unwrap().map(|r| r.unwrap()).collect();
    for (key, _) in &entries {
        txn.delete(key).unwrap();
    }
    txn.commit(Durability::Buffered).unwrap();
    assert_eq!(entries.len(), 10);
    assert!(store.is_empty());
}

#[test]
fn write_in_read_only_fails() {
    let store = MemoryStore::new();
    let txn = store.begin(true).unwrap();
    assert!(matches!(txn.put(b"k", b"v"), Err(StoreError::ReadOnly)));
    assert!(matches!(txn.delete(b"k"), Err(StoreError::ReadOnly)));
}

#[test]
fn commit_read_only_fails() {
    let store = MemoryStore::new();
    let txn = store.begin(true).unwrap();
    assert!(matches!(
        txn.commit(Durability::Buffered),
        Err(StoreError::ReadOnly)
    ));
}

#[test]
fn sync_commits_are_counted() {
    let store = MemoryStore::new();
    let txn = store.begin(false).unwrap();
    txn.put(b"a", b"1").unwrap();
    txn.commit(Durability::Sync).unwrap();

    let txn = store.begin(false).unwrap();
    txn.put(b"b", b"2").unwrap();
    txn.commit(Durability::Buffered).unwrap();

    assert_eq!(store.synced_commits(), 1);
}

#[test]
fn clear_removes_everything() {
    let store = seeded(20);
    store.clear().unwrap();
    assert!(store.is_empty());
    let txn = store.begin(true).unwrap();
    assert_eq!(txn.scan().unwrap().count(), 0);
}

#[test]
fn writers_serialize() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    let txn = store.begin(false).unwrap();
                    txn.put(format!("{t}-{i}").as_bytes(), b"x").unwrap();
                    txn.commit(Durability::Buffered).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(store.len(), 100);
}
