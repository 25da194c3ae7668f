//! Persistence seam for the package catalog.
//!
//! The farm treats the durable store as a swappable collaborator: the
//! catalog actor only ever talks to the [`Store`] trait. Each record's
//! persisted identity is its package name. Two implementations ship here:
//! a JSON file store for single-host deployments and an in-memory store
//! for tests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::catalog::PackageRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable catalog storage, keyed by package name.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PackageRecord>, StoreError>;

    /// Replace the stored catalog wholesale.
    async fn save_all(&self, records: &[PackageRecord]) -> Result<(), StoreError>;

    /// Upsert a single record by name.
    async fn save_one(&self, record: &PackageRecord) -> Result<(), StoreError>;

    async fn load_last_update_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn save_last_update_time(&self, t: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    last_update: Option<DateTime<Utc>>,
    packages: BTreeMap<String, PackageRecord>,
}

/// File-backed store: one JSON document holding the whole catalog.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a crash mid-write never leaves a truncated document behind.
pub struct JsonStore {
    path: PathBuf,
    // Serialises read-modify-write cycles from concurrent workers.
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Document, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn load_all(&self) -> Result<Vec<PackageRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.packages.into_values().collect())
    }

    async fn save_all(&self, records: &[PackageRecord]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.packages = records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        self.write(&doc).await
    }

    async fn save_one(&self, record: &PackageRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.packages.insert(record.name.clone(), record.clone());
        self.write(&doc).await
    }

    async fn load_last_update_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.last_update)
    }

    async fn save_last_update_time(&self, t: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.last_update = Some(t);
        self.write(&doc).await
    }
}

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store with records, as if a previous cycle had run.
    pub async fn seed(&self, records: Vec<PackageRecord>) {
        let mut doc = self.inner.lock().await;
        for r in records {
            doc.packages.insert(r.name.clone(), r);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_all(&self) -> Result<Vec<PackageRecord>, StoreError> {
        Ok(self.inner.lock().await.packages.values().cloned().collect())
    }

    async fn save_all(&self, records: &[PackageRecord]) -> Result<(), StoreError> {
        let mut doc = self.inner.lock().await;
        doc.packages = records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        Ok(())
    }

    async fn save_one(&self, record: &PackageRecord) -> Result<(), StoreError> {
        let mut doc = self.inner.lock().await;
        doc.packages.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn load_last_update_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().await.last_update)
    }

    async fn save_last_update_time(&self, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.lock().await.last_update = Some(t);
        Ok(())
    }
}
