use bson::{Bson, Document};
use cinder_query::Row;
use cinder_query::value::equals;
use cinder_store::Transaction;

use crate::catalog::{KeyGenerator, ShardMap};
use crate::config::ModificationOptions;
use crate::document::{
    self, REV, apply_update, as_object, decode, encode, extract_key, extract_rev, requested_key,
    with_system,
};
use crate::error::DbError;
use crate::planner::plan::ModifyKind;

/// One row of a modification, evaluated and ready to be applied on a shard.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub seq: u64,
    pub row: Row,
    /// Identifies the target document. For INSERT this is the new document.
    pub selector: Bson,
    /// UPDATE patch or REPLACE body.
    pub document: Option<Bson>,
    /// Delivered to a shard that may not own the document: a missing
    /// document is not an error there.
    pub speculative: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteOutcome {
    Executed {
        old: Option<Document>,
        new: Option<Document>,
    },
    Ignored,
}

/// Applies modification rows to the transaction of one shard.
pub(crate) struct WriteContext<'a> {
    pub kind: ModifyKind,
    pub collection: &'a str,
    pub shard_map: &'a ShardMap,
    pub options: &'a ModificationOptions,
    pub keys: &'a KeyGenerator,
}

impl WriteContext<'_> {
    pub fn apply<T: Transaction>(&self, txn: &T, item: &WorkItem) -> Result<WriteOutcome, DbError> {
        let result = match self.kind {
            ModifyKind::Insert => self.insert(txn, item),
            ModifyKind::Update | ModifyKind::Replace => self.modify(txn, item),
            ModifyKind::Remove => self.remove(txn, item),
            ModifyKind::Upsert => Err(DbError::Internal(
                "upsert rows are applied as inserts or updates".into(),
            )),
        };
        match result {
            Err(e) if self.options.ignore_errors && e.is_document_error() => {
                tracing::trace!(error = %e, "ignoring document error");
                Ok(WriteOutcome::Ignored)
            }
            other => other,
        }
    }

    fn insert<T: Transaction>(&self, txn: &T, item: &WorkItem) -> Result<WriteOutcome, DbError> {
        let body = as_object(item.selector.clone())?;
        let key = match requested_key(&body)? {
            Some(key) => key,
            None => self.keys.next_key(),
        };
        let new = with_system(&key, self.collection, &self.keys.next_revision(), &body);
        let old = match txn.get(key.as_bytes())? {
            Some(_) if !self.options.overwrite => {
                return Err(DbError::UniqueConstraintViolated(key));
            }
            Some(bytes) => Some(decode(&bytes)?),
            None => None,
        };
        txn.put(key.as_bytes(), &encode(&new)?)?;
        Ok(WriteOutcome::Executed {
            old,
            new: Some(new),
        })
    }

    /// Reads the target document, or `None` if a speculative row does not
    /// find it here.
    fn lookup<T: Transaction>(
        &self,
        txn: &T,
        item: &WorkItem,
    ) -> Result<Option<(String, Document)>, DbError> {
        let key = extract_key(&item.selector, self.collection)?;
        let Some(bytes) = txn.get(key.as_bytes())? else {
            if item.speculative {
                return Ok(None);
            }
            return Err(DbError::DocumentNotFound(format!("{}/{key}", self.collection)));
        };
        let old = decode(&bytes)?;
        if !self.options.ignore_revs
            && let Some(expected) = extract_rev(&item.selector)
            && old.get_str(REV).ok() != Some(expected)
        {
            return Err(DbError::Conflict);
        }
        Ok(Some((key, old)))
    }

    fn modify<T: Transaction>(&self, txn: &T, item: &WorkItem) -> Result<WriteOutcome, DbError> {
        let Some((key, old)) = self.lookup(txn, item)? else {
            return Ok(WriteOutcome::Ignored);
        };
        let patch = as_object(item.document.clone().unwrap_or(Bson::Null))?;
        let rev = self.keys.next_revision();
        let new = if self.kind == ModifyKind::Update {
            apply_update(
                &old,
                &patch,
                &rev,
                self.options.keep_null,
                self.options.merge_objects,
            )
        } else {
            with_system(&key, self.collection, &rev, &patch)
        };
        let before = self.shard_map.key_tuple(&old);
        let after = self.shard_map.key_tuple(&new);
        if before.iter().zip(&after).any(|(b, a)| !equals(b, a)) {
            return Err(DbError::MustNotChangeShardingAttributes);
        }
        txn.put(key.as_bytes(), &encode(&new)?)?;
        Ok(WriteOutcome::Executed {
            old: Some(old),
            new: Some(new),
        })
    }

    fn remove<T: Transaction>(&self, txn: &T, item: &WorkItem) -> Result<WriteOutcome, DbError> {
        let Some((key, old)) = self.lookup(txn, item)? else {
            return Ok(WriteOutcome::Ignored);
        };
        txn.delete(key.as_bytes())?;
        Ok(WriteOutcome::Executed {
            old: Some(old),
            new: None,
        })
    }
}

/// Gives an INSERT row without `_key` a generated one, so that the key is
/// known before the row is routed.
pub(crate) fn assign_key(body: &mut Document, keys: &KeyGenerator) -> Result<String, DbError> {
    match requested_key(body)? {
        Some(key) => Ok(key),
        None => {
            let key = keys.next_key();
            body.insert(document::KEY, key.clone());
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::{bson, doc};
    use cinder_store::{Durability, MemoryStore, Store};

    use super::*;
    use crate::catalog::Catalog;
    use crate::config::CollectionOptions;

    struct Fixture {
        map: ShardMap,
        keys: KeyGenerator,
        store: MemoryStore,
    }

    fn fixture(shard_keys: &[&str]) -> Fixture {
        let catalog: Catalog<MemoryStore> = Catalog::new();
        let c = catalog
            .create(
                "c",
                &CollectionOptions::with_shards(1).shard_keys(shard_keys.iter().copied()),
                1,
                MemoryStore::new,
            )
            .unwrap();
        Fixture {
            map: c.shard_map().clone(),
            keys: KeyGenerator::new(),
            store: MemoryStore::new(),
        }
    }

    fn item(selector: Bson, document: Option<Bson>) -> WorkItem {
        WorkItem {
            seq: 0,
            row: Row::new(),
            selector,
            document,
            speculative: false,
        }
    }

    fn run(
        f: &Fixture,
        kind: ModifyKind,
        options: &ModificationOptions,
        item: WorkItem,
    ) -> Result<WriteOutcome, DbError> {
        let ctx = WriteContext {
            kind,
            collection: "c",
            shard_map: &f.map,
            options,
            keys: &f.keys,
        };
        let txn = f.store.begin(false).unwrap();
        let out = ctx.apply(&txn, &item);
        txn.commit(Durability::Buffered).unwrap();
        out
    }

    fn new_doc(outcome: WriteOutcome) -> Document {
        match outcome {
            WriteOutcome::Executed { new: Some(d), .. } => d,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn insert_then_duplicate() {
        let f = fixture(&["_key"]);
        let opts = ModificationOptions::default();
        let d = new_doc(run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k", "v": 1 }), None)).unwrap());
        assert_eq!(d.get_str("_id").unwrap(), "c/k");
        let err = run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k" }), None)).unwrap_err();
        assert!(matches!(err, DbError::UniqueConstraintViolated(_)));
    }

    #[test]
    fn insert_overwrite_returns_old() {
        let f = fixture(&["_key"]);
        let opts = ModificationOptions {
            overwrite: true,
            ..Default::default()
        };
        run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k", "v": 1 }), None)).unwrap();
        match run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k", "v": 2 }), None)).unwrap() {
            WriteOutcome::Executed { old: Some(old), new: Some(new) } => {
                assert_eq!(old.get_i32("v").unwrap(), 1);
                assert_eq!(new.get_i32("v").unwrap(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn insert_generates_key() {
        let f = fixture(&["_key"]);
        let d = new_doc(
            run(&f, ModifyKind::Insert, &ModificationOptions::default(), item(bson!({ "v": 1 }), None))
                .unwrap(),
        );
        assert!(!d.get_str("_key").unwrap().is_empty());
    }

    #[test]
    fn insert_rejects_non_objects() {
        let f = fixture(&["_key"]);
        let err = run(&f, ModifyKind::Insert, &ModificationOptions::default(), item(bson!(1), None))
            .unwrap_err();
        assert!(matches!(err, DbError::DocumentTypeInvalid(_)));
    }

    #[test]
    fn update_and_shard_key_change() {
        let f = fixture(&["id"]);
        let opts = ModificationOptions::default();
        run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k", "id": "test", "v": 1 }), None)).unwrap();

        let d = new_doc(
            run(&f, ModifyKind::Update, &opts, item(bson!("k"), Some(bson!({ "v": 2 })))).unwrap(),
        );
        assert_eq!(d.get_str("id").unwrap(), "test");
        assert_eq!(d.get_i32("v").unwrap(), 2);

        let err = run(&f, ModifyKind::Update, &opts, item(bson!("k"), Some(bson!({ "id": "other" }))))
            .unwrap_err();
        assert!(matches!(err, DbError::MustNotChangeShardingAttributes));

        let err = run(&f, ModifyKind::Replace, &opts, item(bson!("k"), Some(bson!({ "v": 3 }))))
            .unwrap_err();
        assert!(matches!(err, DbError::MustNotChangeShardingAttributes));
    }

    #[test]
    fn shard_key_change_is_never_ignored() {
        let f = fixture(&["id"]);
        let opts = ModificationOptions {
            ignore_errors: true,
            ..Default::default()
        };
        run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k", "id": 1 }), None)).unwrap();
        let err = run(&f, ModifyKind::Update, &opts, item(bson!("k"), Some(bson!({ "id": 2 }))))
            .unwrap_err();
        assert!(matches!(err, DbError::MustNotChangeShardingAttributes));
    }

    #[test]
    fn remove_missing_document() {
        let f = fixture(&["_key"]);
        let opts = ModificationOptions::default();
        let err = run(&f, ModifyKind::Remove, &opts, item(bson!("nope"), None)).unwrap_err();
        assert!(matches!(err, DbError::DocumentNotFound(_)));

        let mut speculative = item(bson!("nope"), None);
        speculative.speculative = true;
        assert_eq!(
            run(&f, ModifyKind::Remove, &opts, speculative).unwrap(),
            WriteOutcome::Ignored
        );

        let ignoring = ModificationOptions {
            ignore_errors: true,
            ..Default::default()
        };
        assert_eq!(
            run(&f, ModifyKind::Remove, &ignoring, item(bson!({ "foo": "bar" }), None)).unwrap(),
            WriteOutcome::Ignored
        );
    }

    #[test]
    fn revision_check() {
        let f = fixture(&["_key"]);
        let opts = ModificationOptions::default();
        run(&f, ModifyKind::Insert, &opts, item(bson!({ "_key": "k" }), None)).unwrap();
        let strict = ModificationOptions {
            ignore_revs: false,
            ..Default::default()
        };
        let err = run(&f, ModifyKind::Remove, &strict, item(bson!({ "_key": "k", "_rev": "_bogus" }), None))
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict));
        // The default ignores _rev.
        run(&f, ModifyKind::Remove, &opts, item(bson!({ "_key": "k", "_rev": "_bogus" }), None)).unwrap();
    }

    #[test]
    fn assign_key_keeps_existing() {
        let keys = KeyGenerator::new();
        let mut body = doc! { "_key": "mine" };
        assert_eq!(assign_key(&mut body, &keys).unwrap(), "mine");
        let mut body = doc! { "v": 1 };
        let key = assign_key(&mut body, &keys).unwrap();
        assert_eq!(body.get_str("_key").unwrap(), key);
    }
}
