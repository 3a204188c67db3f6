// ABOUTME: JSON-lines file emitter, one file per object under an output directory
// ABOUTME: Appends across runs; consumers dedupe on the _key column

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use super::{tagged_row, Emitter};
use crate::source::{ObjectType, Record};

pub struct JsonlSink {
    dir: PathBuf,
    writers: Mutex<HashMap<ObjectType, BufWriter<File>>>,
}

impl JsonlSink {
    pub async fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        tracing::info!("Writing records as JSON lines under {}", dir.display());
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, object: ObjectType) -> PathBuf {
        self.dir.join(format!("{}.jsonl", object.as_str()))
    }
}

#[async_trait]
impl Emitter for JsonlSink {
    async fn emit(&self, object: ObjectType, record: &Record) -> Result<()> {
        let mut writers = self.writers.lock().await;
        if !writers.contains_key(&object) {
            let path = self.path_for(object);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to open {:?}", path))?;
            writers.insert(object, BufWriter::new(file));
        }
        let writer = writers
            .get_mut(&object)
            .context("writer missing after open")?;

        let mut line = serde_json::to_vec(&tagged_row(record, Utc::now()))
            .context("Failed to serialize record")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .with_context(|| format!("Failed to write {} record {}", object, record.key()))?;
        Ok(())
    }

    async fn flush(&self, object: ObjectType) -> Result<()> {
        let mut writers = self.writers.lock().await;
        if let Some(writer) = writers.get_mut(&object) {
            writer
                .flush()
                .await
                .with_context(|| format!("Failed to flush {:?}", self.path_for(object)))?;
            writer
                .get_ref()
                .sync_data()
                .await
                .with_context(|| format!("Failed to sync {:?}", self.path_for(object)))?;
        }
        Ok(())
    }
}
