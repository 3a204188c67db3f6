// ABOUTME: Downstream emit collaborators for synced records
// ABOUTME: Emitter trait plus JSONL file, PostgreSQL JSONB and in-memory implementations

pub mod jsonl;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::source::{ObjectType, Record};

pub use jsonl::JsonlSink;
pub use memory::MemorySink;
pub use postgres::PostgresSink;

/// Receives every record of a run. `flush` is called once per run before
/// the watermark is committed; a record is only durable after it returns.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, object: ObjectType, record: &Record) -> Result<()>;
    async fn flush(&self, object: ObjectType) -> Result<()>;
}

/// Output row with replication metadata columns appended.
pub fn tagged_row(record: &Record, synced_at: DateTime<Utc>) -> Value {
    let mut row = match &record.row {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    };
    row.insert("_object".into(), Value::String(record.object_type.to_string()));
    row.insert("_key".into(), Value::String(record.key()));
    row.insert(
        "_synced_at".into(),
        Value::String(synced_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    Value::Object(row)
}
