// ABOUTME: Watermark model and the store contract used by the planner
// ABOUTME: JSON file store for the CLI, in-memory store for embedding and tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::source::ObjectType;

/// How a run materialized its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    FullSnapshot,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::FullSnapshot => f.pad("FULL_SNAPSHOT"),
            SyncMode::Incremental => f.pad("INCREMENTAL"),
        }
    }
}

/// Last successful sync of one watermark key. Replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Start time of the run that produced this watermark
    pub last_sync_timestamp: DateTime<Utc>,
    pub mode_used: SyncMode,
    /// Run diagnostics. Pagination cursors are never stored here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_metadata: Option<serde_json::Value>,
}

/// Key under which an object's watermark is stored.
///
/// Board-scoped objects restricted to explicit boards get their own key per
/// board set, so narrowing or widening the scope starts from a fresh snapshot.
pub fn watermark_key(object: ObjectType, board_ids: Option<&[String]>) -> String {
    match board_ids {
        Some(ids) if object.is_board_scoped() && !ids.is_empty() => {
            let mut sorted: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
            sorted.sort_unstable();
            sorted.dedup();
            format!("{}:boards={}", object.as_str(), sorted.join(","))
        }
        _ => object.as_str().to_string(),
    }
}

/// Durable per-key watermark storage. `put` must replace the key atomically.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Watermark>>;
    async fn put(&self, key: &str, watermark: Watermark) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<Option<Watermark>>;
    async fn list(&self) -> Result<Vec<(String, Watermark)>>;
}

/// On-disk layout of the watermark file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkFile {
    /// Version of the state format for future migrations
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    watermarks: BTreeMap<String, Watermark>,
}

impl WatermarkFile {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            created_at: now,
            updated_at: now,
            watermarks: BTreeMap::new(),
        }
    }
}

/// Watermarks in a single JSON file, rewritten through a temp file and rename.
pub struct FileWatermarkStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from concurrent runs
    lock: tokio::sync::Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Default state file path relative to the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".monday-replicator/watermarks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<WatermarkFile> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(WatermarkFile::new());
        }
        let contents = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read watermarks from {:?}", self.path))?;
        let file: WatermarkFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermarks from {:?}", self.path))?;
        Ok(file)
    }

    async fn save(&self, file: &WatermarkFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(file).context("Failed to serialize watermarks")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write watermarks to {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move watermarks into place at {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.watermarks.get(key).cloned())
    }

    async fn put(&self, key: &str, watermark: Watermark) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.watermarks.insert(key.to_string(), watermark);
        file.updated_at = Utc::now();
        self.save(&file).await
    }

    async fn remove(&self, key: &str) -> Result<Option<Watermark>> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let removed = file.watermarks.remove(key);
        if removed.is_some() {
            file.updated_at = Utc::now();
            self.save(&file).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<(String, Watermark)>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.watermarks.into_iter().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    watermarks: std::sync::Mutex<BTreeMap<String, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Watermark>> {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, key: &str) -> Result<Option<Watermark>> {
        Ok(self.map().get(key).cloned())
    }

    async fn put(&self, key: &str, watermark: Watermark) -> Result<()> {
        self.map().insert(key.to_string(), watermark);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<Watermark>> {
        Ok(self.map().remove(key))
    }

    async fn list(&self) -> Result<Vec<(String, Watermark)>> {
        Ok(self
            .map()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
