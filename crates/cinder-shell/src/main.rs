//! Line-oriented shell over an in-memory database.
//!
//! ```text
//! create <name> [shards] [key,key...]
//! drop <name>
//! collections
//! explain <query>
//! <query>
//! ```
//!
//! Every command prints one JSON line.

use std::io::{self, BufRead, Write};

use bson::Document;
use cinder_db::{CollectionOptions, Database, DatabaseConfig, DbError, MemoryStore, QueryOptions};
use serde::Serialize;
use serde_json::{Value, json};

fn main() {
    tracing_subscriber::fmt::init();

    let config = DatabaseConfig::from_env();
    tracing::info!(
        default_shards = config.default_number_of_shards,
        channel_capacity = config.channel_capacity,
        "cinder-shell ready"
    );
    let db = Database::in_memory(config);

    let mut out = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line.unwrap_or_else(|e| {
            eprintln!("failed to read input: {e}");
            std::process::exit(1);
        });
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if writeln!(out, "{}", run(&db, line)).is_err() {
            break;
        }
    }
}

fn run(db: &Database<MemoryStore>, line: &str) -> Value {
    let (command, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(c, r)| (c, r.trim()));
    match command.to_ascii_lowercase().as_str() {
        "create" => create(db, rest),
        "drop" => match db.drop_collection(rest) {
            Ok(()) => json!({ "dropped": rest }),
            Err(e) => error(&e),
        },
        "collections" => json!(db.collections()),
        "explain" => match db.explain(rest, Document::new(), QueryOptions::default()) {
            Ok(explain) => to_json(&explain),
            Err(e) => error(&e),
        },
        _ => match db.query(line, Document::new(), QueryOptions::default()) {
            Ok(cursor) => to_json(&cursor),
            Err(failure) => {
                let mut reply = error(&failure.error);
                reply["stats"] = to_json(&failure.stats);
                reply
            }
        },
    }
}

fn create(db: &Database<MemoryStore>, args: &str) -> Value {
    let mut args = args.split_whitespace();
    let Some(name) = args.next() else {
        return json!({ "error": true, "errorMessage": "usage: create <name> [shards] [keys]" });
    };
    let mut options = CollectionOptions::default();
    if let Some(shards) = args.next() {
        match shards.parse() {
            Ok(n) => options.number_of_shards = Some(n),
            Err(_) => {
                return json!({ "error": true, "errorMessage": format!("invalid shard count '{shards}'") });
            }
        }
    }
    if let Some(keys) = args.next() {
        options = options.shard_keys(keys.split(','));
    }
    match db.create_collection(name, options) {
        Ok(handle) => json!({
            "name": handle.name(),
            "numberOfShards": handle.number_of_shards(),
            "shardKeys": handle.shard_keys(),
            "shards": to_json(&handle.shards()),
        }),
        Err(e) => error(&e),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value)
        .unwrap_or_else(|e| json!({ "error": true, "errorMessage": e.to_string() }))
}

fn error(e: &DbError) -> Value {
    json!({
        "error": true,
        "errorNum": e.error_num(),
        "errorName": e.error_name(),
        "errorMessage": e.to_string(),
    })
}
