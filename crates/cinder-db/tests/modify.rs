mod common;
use common::*;

use bson::{Bson, doc};
use cinder_db::{DbError, QueryOptions};

fn stored(db: &cinder_db::Database<cinder_store::MemoryStore>, key: &str) -> bson::Document {
    db.document(COLLECTION, key).unwrap().unwrap()
}

// ── INSERT ──────────────────────────────────────────────────

#[test]
fn insert_generates_system_attributes() {
    let db = sharded(3, &[]);
    let cursor = query(&db, "INSERT { value: 1 } INTO @@c RETURN NEW");
    assert_eq!(cursor.stats().writes(), (1, 0));
    let Bson::Document(new) = &cursor.rows()[0] else {
        panic!("expected a document");
    };
    let key = new.get_str("_key").unwrap();
    assert_eq!(new.get_str("_id").unwrap(), format!("{COLLECTION}/{key}"));
    assert!(new.get_str("_rev").unwrap().starts_with('_'));
    assert_eq!(stored(&db, key), *new);
}

#[test]
fn insert_without_overwrite_returns_null_old() {
    let db = sharded(3, &[]);
    let cursor = query(
        &db,
        "FOR i IN 1..2 INSERT { v: i } INTO @@c RETURN [OLD, NEW.v]",
    );
    let rows = cursor.rows().to_vec();
    assert_eq!(rows.len(), 2);
    for row in rows {
        let Bson::Array(pair) = row else {
            panic!("expected an array");
        };
        assert_eq!(pair[0], Bson::Null);
        assert!(matches!(pair[1], Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)));
    }
}

#[test]
fn insert_duplicate_key() {
    let db = sharded(3, &[]);
    query(&db, "INSERT { _key: 'a', v: 1 } INTO @@c");

    let failure = query_err(&db, "INSERT { _key: 'a', v: 2 } INTO @@c");
    assert_eq!(failure.error.error_num(), 1210);

    let cursor = query(
        &db,
        "INSERT { _key: 'a', v: 3 } INTO @@c OPTIONS { ignoreErrors: true }",
    );
    assert_eq!(cursor.stats().writes(), (0, 1));
    assert_eq!(number(stored(&db, "a").get("v").unwrap()), 1);

    let cursor = query(
        &db,
        "INSERT { _key: 'a', v: 4 } INTO @@c OPTIONS { overwrite: true } RETURN OLD.v",
    );
    assert_eq!(numbers(&cursor), vec![1]);
    assert_eq!(number(stored(&db, "a").get("v").unwrap()), 4);
    assert_eq!(db.count(COLLECTION).unwrap(), 1);
}

#[test]
fn insert_rejects_non_objects() {
    let db = sharded(2, &[]);
    assert_eq!(query_err(&db, "INSERT 1 INTO @@c").error.error_num(), 1227);
    assert_eq!(
        query_err(&db, "FOR i IN [1] INSERT i INTO @@c").error.error_num(),
        1227
    );
    let cursor = query(
        &db,
        "FOR x IN [1, { v: 2 }] INSERT x INTO @@c OPTIONS { ignoreErrors: true }",
    );
    assert_eq!(cursor.stats().writes(), (1, 1));
}

#[test]
fn insert_rejects_bad_keys() {
    let db = sharded(2, &[]);
    assert_eq!(
        query_err(&db, "INSERT { _key: 'no spaces' } INTO @@c").error.error_num(),
        1221
    );
    assert_eq!(
        query_err(&db, "FOR k IN [1] INSERT { _key: k } INTO @@c")
            .error
            .error_num(),
        1221
    );
}

// ── UPDATE / REPLACE ────────────────────────────────────────

#[test]
fn update_merges_patch() {
    let db = sharded(3, &[]);
    query(
        &db,
        "INSERT { _key: 'a', v: 1, keep: true, nested: { x: 1, y: 2 } } INTO @@c",
    );
    query(&db, "UPDATE 'a' WITH { v: 2, nested: { y: 3 } } IN @@c");
    let doc = stored(&db, "a");
    assert_eq!(number(doc.get("v").unwrap()), 2);
    assert!(doc.get_bool("keep").unwrap());
    let nested = doc.get_document("nested").unwrap();
    assert_eq!(number(nested.get("x").unwrap()), 1);
    assert_eq!(number(nested.get("y").unwrap()), 3);
}

#[test]
fn update_options_control_nulls_and_nesting() {
    let db = sharded(3, &[]);
    query(&db, "INSERT { _key: 'a', v: 1, nested: { x: 1, y: 2 } } INTO @@c");

    query(&db, "UPDATE 'a' WITH { v: null } IN @@c");
    assert_eq!(stored(&db, "a").get("v"), Some(&Bson::Null));

    query(&db, "UPDATE 'a' WITH { v: null } IN @@c OPTIONS { keepNull: false }");
    assert!(!stored(&db, "a").contains_key("v"));

    query(
        &db,
        "UPDATE 'a' WITH { nested: { y: 3 } } IN @@c OPTIONS { mergeObjects: false }",
    );
    let nested = stored(&db, "a").get_document("nested").unwrap().clone();
    assert!(!nested.contains_key("x"));
    assert_eq!(number(nested.get("y").unwrap()), 3);
}

#[test]
fn update_ignores_system_attributes_in_patch() {
    let db = sharded(3, &[]);
    query(&db, "INSERT { _key: 'a', v: 1 } INTO @@c");
    query(&db, "UPDATE { _key: 'a', _id: 'other/b', v: 2 } IN @@c");
    let doc = stored(&db, "a");
    assert_eq!(doc.get_str("_id").unwrap(), format!("{COLLECTION}/a"));
    assert_eq!(number(doc.get("v").unwrap()), 2);
}

#[test]
fn replace_keeps_only_the_key() {
    let db = sharded(3, &[]);
    query(&db, "INSERT { _key: 'a', v: 1 } INTO @@c");
    let cursor = query(&db, "REPLACE 'a' WITH { w: 1 } IN @@c RETURN [OLD.v, NEW.w]");
    let Some(Bson::Array(pair)) = cursor.rows().first() else {
        panic!("expected an array");
    };
    assert_eq!(pair.iter().map(number).collect::<Vec<_>>(), vec![1, 1]);
    let doc = stored(&db, "a");
    assert!(!doc.contains_key("v"));
    assert_eq!(doc.get_str("_key").unwrap(), "a");
    assert_eq!(doc.get_str("_id").unwrap(), format!("{COLLECTION}/a"));
}

#[test]
fn revision_check() {
    let db = sharded(3, &[]);
    let cursor = query(&db, "INSERT { _key: 'a', v: 1 } INTO @@c RETURN NEW._rev");
    let rev = cursor.rows()[0].as_str().unwrap().to_string();

    let failure = query_err(
        &db,
        "UPDATE { _key: 'a', _rev: 'bogus' } WITH { v: 2 } IN @@c OPTIONS { ignoreRevs: false }",
    );
    assert!(matches!(failure.error, DbError::Conflict));
    assert_eq!(failure.error.error_num(), 1200);

    // Ignored by default.
    query(&db, "UPDATE { _key: 'a', _rev: 'bogus' } WITH { v: 2 } IN @@c");

    let failure = query_err(
        &db,
        &format!(
            "REPLACE {{ _key: 'a', _rev: '{rev}' }} WITH {{ v: 3 }} IN @@c OPTIONS {{ ignoreRevs: false }}"
        ),
    );
    assert_eq!(failure.error.error_num(), 1200);
}

// ── REMOVE ──────────────────────────────────────────────────

#[test]
fn remove_missing_document() {
    // One shard, so the failing statement rolls back the removal of 'a'.
    let db = sharded(1, &[]);
    query(&db, "INSERT { _key: 'a' } INTO @@c");

    let failure = query_err(&db, "FOR k IN ['a', 'missing'] REMOVE k IN @@c");
    assert_eq!(failure.error.error_num(), 1202);
    assert_eq!(failure.error.error_name(), "ERROR_ARANGO_DOCUMENT_NOT_FOUND");

    let cursor = query(
        &db,
        "FOR k IN ['a', 'missing'] REMOVE k IN @@c OPTIONS { ignoreErrors: true }",
    );
    assert_eq!(cursor.stats().writes(), (1, 1));
    assert_eq!(db.count(COLLECTION).unwrap(), 0);
}

#[test]
fn remove_without_key() {
    let db = sharded(3, &[]);
    let failure = query_err(&db, "REMOVE { v: 1 } IN @@c");
    assert_eq!(failure.error.error_num(), 1226);
    assert_eq!(failure.error.error_name(), "ERROR_ARANGO_DOCUMENT_KEY_MISSING");

    let failure = query_err(&db, "FOR x IN [{ v: 1 }] REMOVE x IN @@c");
    assert_eq!(failure.error.error_num(), 1226);

    let cursor = query(
        &db,
        "FOR x IN [{ v: 1 }, 7] REMOVE x IN @@c OPTIONS { ignoreErrors: true }",
    );
    assert_eq!(cursor.stats().writes(), (0, 2));
}

#[test]
fn remove_accepts_ids_of_the_same_collection() {
    let db = sharded(3, &[]);
    query(&db, "FOR k IN ['a', 'b'] INSERT { _key: k } INTO @@c");
    query(&db, "REMOVE 'UnitTestsCollection/a' IN @@c");
    assert!(db.document(COLLECTION, "a").unwrap().is_none());

    let failure = query_err(&db, "REMOVE 'other/b' IN @@c");
    assert_eq!(failure.error.error_num(), 1221);
    assert!(db.document(COLLECTION, "b").unwrap().is_some());
}

// ── Statement shape ─────────────────────────────────────────

#[test]
fn limit_bounds_the_writes() {
    let db = sharded(5, &[]);
    seed(&db, 20);

    let cursor = query(
        &db,
        "FOR d IN @@c LIMIT 5, 10 UPDATE d WITH { touched: true } IN @@c",
    );
    assert_eq!(cursor.stats().writes(), (10, 0));
    let touched = query(
        &db,
        "FOR d IN @@c FILTER d.touched == true COLLECT WITH COUNT INTO n RETURN n",
    );
    assert_eq!(numbers(&touched), vec![10]);

    let cursor = query(&db, "FOR d IN @@c LIMIT 3 REMOVE d IN @@c");
    assert_eq!(cursor.stats().writes(), (3, 0));
    assert_eq!(db.count(COLLECTION).unwrap(), 17);

    let cursor = query(&db, "FOR d IN @@c LIMIT 0 REMOVE d IN @@c");
    assert_eq!(cursor.stats().writes(), (0, 0));
}

#[test]
fn return_old_and_new() {
    let db = sharded(5, &[]);
    seed(&db, 10);

    let cursor = query(
        &db,
        "FOR d IN @@c FILTER d.value <= 3 UPDATE d WITH { value: d.value * 10 } IN @@c RETURN { before: OLD.value, after: NEW.value }",
    );
    let mut pairs: Vec<(i64, i64)> = cursor
        .rows()
        .iter()
        .map(|row| {
            let Bson::Document(d) = row else {
                panic!("expected a document");
            };
            (number(d.get("before").unwrap()), number(d.get("after").unwrap()))
        })
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);

    let removed = query(
        &db,
        "FOR d IN @@c FILTER d.value > 5 REMOVE d IN @@c RETURN OLD.value",
    );
    assert_eq!(numbers(&removed), vec![6, 7, 8, 9, 10, 10, 20, 30]);
}

#[test]
fn count_of_modified_rows() {
    let db = sharded(5, &[]);
    seed(&db, 25);
    let cursor = query(
        &db,
        "FOR d IN @@c REMOVE d IN @@c COLLECT WITH COUNT INTO n RETURN n",
    );
    assert_eq!(numbers(&cursor), vec![25]);
    assert_eq!(cursor.stats().writes(), (25, 0));
}

#[test]
fn subquery_collects_returned_rows() {
    let db = sharded(3, &[]);
    let cursor = query(
        &db,
        "RETURN (FOR i IN 1..3 INSERT { _key: CONCAT('s', i), n: i } INTO @@c RETURN NEW.n)",
    );
    assert_eq!(cursor.len(), 1);
    let Bson::Array(values) = &cursor.rows()[0] else {
        panic!("expected an array");
    };
    let mut values: Vec<i64> = values.iter().map(number).collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(cursor.stats().writes(), (3, 0));
}

#[test]
fn read_only_queries() {
    let db = sharded(4, &[]);
    seed(&db, 30);
    let cursor = query(&db, "FOR d IN @@c FILTER d.value % 2 == 0 RETURN d.value");
    assert_eq!(numbers(&cursor), (1..=15).map(|n| n * 2).collect::<Vec<i64>>());
    assert_eq!(cursor.stats().scanned_full, 30);
    assert_eq!(cursor.stats().filtered, 15);
    assert_eq!(cursor.stats().writes(), (0, 0));

    let cursor = query(&db, "FOR d IN @@c FILTER d._key == 'test7' RETURN d.value");
    assert_eq!(numbers(&cursor), vec![7]);
    assert_eq!(cursor.stats().scanned_index, 1);
    assert_eq!(cursor.stats().scanned_full, 0);
}

// ── Failure handling ────────────────────────────────────────

#[test]
fn failure_rolls_back_uncommitted_writes() {
    let db = sharded(1, &[]);
    let failure = query_err(
        &db,
        "FOR i IN [1, 2, 3, 4, 5, 1, 7] INSERT { _key: TO_STRING(i) } INTO @@c",
    );
    assert_eq!(failure.error.error_num(), 1210);
    assert_eq!(failure.stats.writes_executed, 0);
    assert_eq!(db.count(COLLECTION).unwrap(), 0);
}

#[test]
fn intermediate_commits_survive_failure() {
    let db = sharded(1, &[]);
    let options = QueryOptions {
        intermediate_commit_count: Some(2),
        ..QueryOptions::default()
    };
    let failure = query_err_with(
        &db,
        "FOR i IN [1, 2, 3, 4, 5, 1, 7] INSERT { _key: TO_STRING(i) } INTO @@c",
        options,
    );
    assert_eq!(failure.error.error_num(), 1210);
    assert_eq!(failure.stats.writes_executed, 4);
    assert_eq!(db.count(COLLECTION).unwrap(), 4);
}

#[test]
fn bind_parameters() {
    let db = sharded(2, &[]);
    let cursor = query_with(
        &db,
        "INSERT @doc INTO @@c RETURN NEW.v",
        doc! { "doc": { "_key": "b", "v": 5 } },
        QueryOptions::default(),
    );
    assert_eq!(numbers(&cursor), vec![5]);

    let failure = query_err(&db, "INSERT @doc INTO @@c");
    assert_eq!(failure.error.error_name(), "ERROR_QUERY_BIND_PARAMETER_MISSING");
}
