use std::fmt;

use bson::{Bson, Document};
use cinder_query::value::{as_f64, get_path};
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

/// Identifier of one shard, e.g. `s100004`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub(crate) fn new(number: u64) -> Self {
        ShardId(format!("s{number}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps shard-key tuples to the shards of one collection.
///
/// The mapping is fixed for the lifetime of the collection: the shard list
/// never changes and [`ShardMap::shard_index`] is a pure function of the
/// tuple.
#[derive(Debug, Clone)]
pub struct ShardMap {
    shards: Vec<ShardId>,
    shard_keys: Vec<String>,
}

impl ShardMap {
    pub(crate) fn new(shards: Vec<ShardId>, shard_keys: Vec<String>) -> Self {
        debug_assert!(!shards.is_empty());
        Self { shards, shard_keys }
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    pub fn shard_keys(&self) -> &[String] {
        &self.shard_keys
    }

    /// Sharded by `_key` alone.
    pub fn uses_default_sharding(&self) -> bool {
        self.shard_keys.len() == 1 && self.shard_keys[0] == "_key"
    }

    /// Position of the owning shard in [`ShardMap::shards`].
    pub fn shard_index(&self, tuple: &[Bson]) -> usize {
        (hash_tuple(tuple) % self.shards.len() as u64) as usize
    }

    pub fn shard_for(&self, tuple: &[Bson]) -> &ShardId {
        &self.shards[self.shard_index(tuple)]
    }

    /// Shard-key values of a document; a missing attribute reads as null.
    pub fn key_tuple(&self, doc: &Document) -> Vec<Bson> {
        self.shard_keys
            .iter()
            .map(|key| get_path(doc, key).cloned().unwrap_or(Bson::Null))
            .collect()
    }

    /// Like [`ShardMap::key_tuple`], but `None` unless every shard-key
    /// attribute is present.
    pub fn complete_key_tuple(&self, doc: &Document) -> Option<Vec<Bson>> {
        self.shard_keys
            .iter()
            .map(|key| get_path(doc, key).cloned())
            .collect()
    }

    pub fn shard_index_of(&self, doc: &Document) -> usize {
        self.shard_index(&self.key_tuple(doc))
    }
}

// ── Hashing ─────────────────────────────────────────────────

/// xxh3 over a type-tagged encoding of the tuple.
///
/// Numbers are normalised to `f64`, so `42`, `42i64` and `42.0` hash the
/// same; null and a missing attribute hash the same; document attributes
/// are hashed in sorted order.
pub(crate) fn hash_tuple(tuple: &[Bson]) -> u64 {
    let mut buf = Vec::with_capacity(32);
    for value in tuple {
        encode_value(&mut buf, value);
    }
    xxh3_64(&buf)
}

fn encode_value(buf: &mut Vec<u8>, value: &Bson) {
    match value {
        Bson::Null | Bson::Undefined => buf.push(0),
        Bson::Boolean(b) => buf.extend_from_slice(&[1, u8::from(*b)]),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let n = as_f64(value).unwrap_or(0.0);
            // -0.0 and 0.0 compare equal, so they must hash equal.
            let n = if n == 0.0 { 0.0 } else { n };
            buf.push(2);
            buf.extend_from_slice(&n.to_bits().to_le_bytes());
        }
        Bson::String(s) => {
            buf.push(3);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0xff);
        }
        Bson::Array(items) => {
            buf.push(4);
            for item in items {
                encode_value(buf, item);
            }
            buf.push(0xfe);
        }
        Bson::Document(doc) => {
            buf.push(5);
            let mut keys: Vec<&String> = doc.keys().collect();
            keys.sort();
            for key in keys {
                buf.extend_from_slice(key.as_bytes());
                buf.push(0xff);
                if let Some(v) = doc.get(key) {
                    encode_value(buf, v);
                }
            }
            buf.push(0xfd);
        }
        other => {
            buf.push(6);
            buf.extend_from_slice(other.to_string().as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn map(n: u64, keys: &[&str]) -> ShardMap {
        ShardMap::new(
            (0..n).map(|i| ShardId::new(100 + i)).collect(),
            keys.iter().map(|k| k.to_string()).collect(),
        )
    }

    #[test]
    fn deterministic() {
        let m = map(5, &["id"]);
        let t = vec![Bson::String("test".into())];
        let first = m.shard_index(&t);
        for _ in 0..10 {
            assert_eq!(m.shard_index(&t), first);
        }
    }

    #[test]
    fn numbers_hash_by_value() {
        assert_eq!(
            hash_tuple(&[Bson::Int32(42)]),
            hash_tuple(&[Bson::Double(42.0)])
        );
        assert_eq!(
            hash_tuple(&[Bson::Int64(42)]),
            hash_tuple(&[Bson::Int32(42)])
        );
        assert_ne!(
            hash_tuple(&[Bson::Int32(42)]),
            hash_tuple(&[Bson::String("42".into())])
        );
    }

    #[test]
    fn missing_attribute_equals_null() {
        let m = map(7, &["a", "b"]);
        let with_null = doc! { "a": 1, "b": null };
        let missing = doc! { "a": 1 };
        assert_eq!(m.shard_index_of(&with_null), m.shard_index_of(&missing));
        assert!(m.complete_key_tuple(&missing).is_none());
        assert!(m.complete_key_tuple(&with_null).is_some());
    }

    #[test]
    fn nested_shard_key() {
        let m = map(5, &["a.b"]);
        let d = doc! { "a": { "b": "test1" }, "value": 1 };
        assert_eq!(m.key_tuple(&d), vec![Bson::String("test1".into())]);
    }

    #[test]
    fn keys_spread_over_shards() {
        let m = map(5, &["_key"]);
        let mut used = [0usize; 5];
        for i in 0..1000 {
            used[m.shard_index(&[Bson::String(format!("test{i}"))])] += 1;
        }
        assert!(used.iter().all(|&n| n > 100), "uneven spread: {used:?}");
    }

    #[test]
    fn single_shard_always_zero() {
        let m = map(1, &["_key"]);
        assert_eq!(m.shard_index(&[Bson::String("anything".into())]), 0);
        assert!(m.uses_default_sharding());
    }

    #[test]
    fn zero_signs_hash_alike() {
        assert_eq!(
            hash_tuple(&[Bson::Double(-0.0)]),
            hash_tuple(&[Bson::Int32(0)])
        );
    }

    #[test]
    fn tuple_boundaries_matter() {
        let joined = [Bson::String("ab".into())];
        let split = [Bson::String("a".into()), Bson::String("b".into())];
        assert_ne!(hash_tuple(&joined), hash_tuple(&split));
    }

    #[test]
    fn document_attribute_order_is_irrelevant() {
        let a = Bson::Document(doc! { "x": 1, "y": 2 });
        let b = Bson::Document(doc! { "y": 2, "x": 1 });
        assert_eq!(hash_tuple(&[a]), hash_tuple(&[b]));
    }
}
