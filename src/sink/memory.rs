// ABOUTME: In-memory emitter that keeps every record it receives
// ABOUTME: Used when embedding the engine and by tests; can be told to fail after N records

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::Emitter;
use crate::source::{ObjectType, Record};

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    flushes: Mutex<Vec<ObjectType>>,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that accepts `n` records and rejects the rest.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn flushes(&self) -> Vec<ObjectType> {
        self.flushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.flushes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl Emitter for MemorySink {
    async fn emit(&self, _object: ObjectType, record: &Record) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = self.fail_after {
            if records.len() >= limit {
                bail!("sink rejected record {} after {} records", record.key(), limit);
            }
        }
        records.push(record.clone());
        Ok(())
    }

    async fn flush(&self, object: ObjectType) -> Result<()> {
        self.flushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(object);
        Ok(())
    }
}
