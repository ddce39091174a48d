#![allow(dead_code)]

use bson::{Bson, Document, doc};
use cinder_db::{CollectionOptions, Cursor, Database, DatabaseConfig, QueryFailure, QueryOptions};
use cinder_store::MemoryStore;

pub const COLLECTION: &str = "UnitTestsCollection";

pub fn db() -> Database<MemoryStore> {
    Database::in_memory(DatabaseConfig::default())
}

/// Creates `COLLECTION` with `shards` shards and the given shard keys.
pub fn sharded(shards: u32, keys: &[&str]) -> Database<MemoryStore> {
    let db = db();
    let mut options = CollectionOptions::with_shards(shards);
    if !keys.is_empty() {
        options = options.shard_keys(keys.iter().copied());
    }
    db.create_collection(COLLECTION, options).unwrap();
    db
}

pub fn binds() -> Document {
    doc! { "@c": COLLECTION }
}

pub fn query(db: &Database<MemoryStore>, text: &str) -> Cursor {
    query_with(db, text, doc! {}, QueryOptions::default())
}

pub fn query_with(
    db: &Database<MemoryStore>,
    text: &str,
    mut bind_vars: Document,
    options: QueryOptions,
) -> Cursor {
    if text.contains("@@c") {
        for (name, value) in binds() {
            bind_vars.insert(name, value);
        }
    }
    match db.query(text, bind_vars, options) {
        Ok(cursor) => cursor,
        Err(e) => panic!("query {text:?} failed: {e} ({})", e.error.error_name()),
    }
}

pub fn query_err(db: &Database<MemoryStore>, text: &str) -> QueryFailure {
    query_err_with(db, text, QueryOptions::default())
}

pub fn query_err_with(
    db: &Database<MemoryStore>,
    text: &str,
    options: QueryOptions,
) -> QueryFailure {
    let bind_vars = if text.contains("@@c") { binds() } else { doc! {} };
    match db.query(text, bind_vars, options) {
        Ok(cursor) => panic!("query {text:?} succeeded with {:?}", cursor.rows()),
        Err(e) => e,
    }
}

pub fn rules(entries: &[&str]) -> QueryOptions {
    QueryOptions::with_rules(entries.iter().copied())
}

pub fn number(v: &Bson) -> i64 {
    match v {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(n) => *n as i64,
        other => panic!("expected a number, got {other}"),
    }
}

/// The numeric rows of a cursor, sorted.
pub fn numbers(cursor: &Cursor) -> Vec<i64> {
    let mut out: Vec<i64> = cursor.rows().iter().map(number).collect();
    out.sort_unstable();
    out
}

/// `field` of every document row, sorted.
pub fn field_numbers(cursor: &Cursor, field: &str) -> Vec<i64> {
    let mut out: Vec<i64> = cursor
        .rows()
        .iter()
        .map(|row| match row {
            Bson::Document(d) => number(d.get(field).unwrap_or(&Bson::Null)),
            other => panic!("expected a document, got {other}"),
        })
        .collect();
    out.sort_unstable();
    out
}

/// Inserts documents `{ _key: "test<i>", id: "test<i>", value: i }` for
/// `i` in `1..=n`.
pub fn seed(db: &Database<MemoryStore>, n: u32) {
    let cursor = query(
        db,
        &format!(
            "FOR i IN 1..{n} INSERT {{ _key: CONCAT('test', i), id: CONCAT('test', i), value: i }} INTO {COLLECTION}"
        ),
    );
    assert_eq!(cursor.stats().writes_executed, u64::from(n));
}
