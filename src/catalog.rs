//! Package catalog actor.
//!
//! The catalog is the farm's single shared table: one row per binary package
//! name, mutated by the reconciler and by every build worker, read by the
//! queue builder and the dashboard. Workers run concurrently, so the table
//! is hosted in a dedicated task and accessed via message passing; the
//! [`CatalogHandle`] is the Send + Sync + Clone face of that task.
//!
//! All mutations are whole-record replaces keyed by name. A build job's
//! member records are updated by a single message, so no reader ever
//! observes a partially-updated job.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::queue::{self, BuildJob};
use crate::store::{Store, StoreError};

/// Lifecycle state of a package, as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PackageStatus {
    /// Local build matches the upstream version.
    #[default]
    Uptodate,
    /// Upstream has a newer version than the local build.
    Stale,
    /// Seen upstream, never built locally.
    Missing,
    /// Selected for building, waiting for a worker.
    Queued,
    /// A worker is building it right now.
    Building,
    /// Most recent build attempt succeeded.
    Built,
    /// Most recent build attempt failed.
    Error,
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uptodate => "Uptodate",
            Self::Stale => "Stale",
            Self::Missing => "Missing",
            Self::Queued => "Queued",
            Self::Building => "Building",
            Self::Built => "Built",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// One row per binary package name. The name is the catalog's sole identity:
/// records are replaced, never duplicated, and never deleted — only
/// re-statused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Binary package name (catalog key).
    pub name: String,
    /// Currently built / known-good version.
    pub version: String,
    /// Source-package grouping key; empty means "same as name".
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub description: String,
    pub status: PackageStatus,
    /// Version seen upstream but not yet built. Cleared once a build using
    /// it succeeds.
    #[serde(default)]
    pub pending_version: String,
    /// Version string attempted in the most recent build.
    #[serde(default)]
    pub last_build_version: String,
    /// Consecutive failed builds since the last success. Sole driver of
    /// build-command-variant selection.
    #[serde(default)]
    pub build_attempts: u32,
    /// Outcome of the most recent build attempt, independent of `status`.
    #[serde(default)]
    pub last_build_status: Option<PackageStatus>,
}

impl PackageRecord {
    /// Grouping key for build jobs: the source package, falling back to the
    /// binary name when the index carried no `Source` field.
    pub fn source_key(&self) -> &str {
        if self.source.is_empty() {
            &self.name
        } else {
            &self.source
        }
    }
}

/// Aggregate counts for the dashboard collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub stale: usize,
    pub missing: usize,
    pub built: usize,
    pub error: usize,
    pub queued: usize,
    pub building: usize,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog actor is gone")]
    ActorGone,

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum CatalogEvent {
    /// Rebuild in-memory state from the store. Read failures are logged and
    /// tolerated: the farm can always re-derive the catalog from a fetch.
    Load {
        resp: oneshot::Sender<()>,
    },
    /// Wholesale replacement after a reconciliation pass.
    ReplaceAll {
        records: Vec<PackageRecord>,
        resp: oneshot::Sender<Result<(), CatalogError>>,
    },
    Snapshot {
        resp: oneshot::Sender<Vec<PackageRecord>>,
    },
    Get {
        name: String,
        resp: oneshot::Sender<Option<PackageRecord>>,
    },
    Counts {
        resp: oneshot::Sender<StatusCounts>,
    },
    LastUpdate {
        resp: oneshot::Sender<Option<DateTime<Utc>>>,
    },
    /// Replace every record of one build job in a single step. `persist`
    /// forces the remote write; without it the update is local-only
    /// visibility (e.g. flipping to Building).
    UpdateJob {
        records: Vec<PackageRecord>,
        persist: bool,
        resp: oneshot::Sender<Result<(), CatalogError>>,
    },
    /// Select every Missing/Stale record, mark it Queued (persisted), and
    /// return the grouped jobs.
    TakeBuildQueue {
        resp: oneshot::Sender<Result<Vec<BuildJob>, CatalogError>>,
    },
    Shutdown,
}

/// Cloneable handle to the catalog actor.
#[derive(Clone)]
pub struct CatalogHandle {
    sender: mpsc::UnboundedSender<CatalogEvent>,
}

impl CatalogHandle {
    /// Spawn the catalog actor owning `store`.
    pub fn spawn(store: Box<dyn Store>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_catalog_loop(store, receiver));
        Self { sender }
    }

    async fn request<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(oneshot::Sender<T>) -> CatalogEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.sender.send(f(tx)).map_err(|_| CatalogError::ActorGone)?;
        rx.await.map_err(|_| CatalogError::ActorGone)
    }

    /// Rebuild the in-memory catalog from the store (best effort).
    pub async fn load(&self) -> Result<(), CatalogError> {
        self.request(|resp| CatalogEvent::Load { resp }).await
    }

    /// Replace the whole catalog and persist it.
    pub async fn replace_all(&self, records: Vec<PackageRecord>) -> Result<(), CatalogError> {
        self.request(|resp| CatalogEvent::ReplaceAll { records, resp })
            .await?
    }

    /// Every record, sorted by name.
    pub async fn snapshot(&self) -> Result<Vec<PackageRecord>, CatalogError> {
        self.request(|resp| CatalogEvent::Snapshot { resp }).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<PackageRecord>, CatalogError> {
        let name = name.to_string();
        self.request(|resp| CatalogEvent::Get { name, resp }).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, CatalogError> {
        self.request(|resp| CatalogEvent::Counts { resp }).await
    }

    pub async fn last_update(&self) -> Result<Option<DateTime<Utc>>, CatalogError> {
        self.request(|resp| CatalogEvent::LastUpdate { resp }).await
    }

    /// Atomically replace every record of one job. With `persist` the
    /// records are also written through to the store.
    pub async fn update_job(
        &self,
        records: Vec<PackageRecord>,
        persist: bool,
    ) -> Result<(), CatalogError> {
        self.request(|resp| CatalogEvent::UpdateJob {
            records,
            persist,
            resp,
        })
        .await?
    }

    /// Select, mark Queued, persist, and return the build queue.
    pub async fn take_build_queue(&self) -> Result<Vec<BuildJob>, CatalogError> {
        self.request(|resp| CatalogEvent::TakeBuildQueue { resp })
            .await?
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(CatalogEvent::Shutdown);
    }
}

struct CatalogState {
    records: BTreeMap<String, PackageRecord>,
    last_update: Option<DateTime<Utc>>,
    store: Box<dyn Store>,
}

async fn run_catalog_loop(
    store: Box<dyn Store>,
    mut receiver: mpsc::UnboundedReceiver<CatalogEvent>,
) {
    let mut state = CatalogState {
        records: BTreeMap::new(),
        last_update: None,
        store,
    };

    while let Some(event) = receiver.recv().await {
        match event {
            CatalogEvent::Load { resp } => {
                state.load().await;
                let _ = resp.send(());
            }
            CatalogEvent::ReplaceAll { records, resp } => {
                let _ = resp.send(state.replace_all(records).await);
            }
            CatalogEvent::Snapshot { resp } => {
                let _ = resp.send(state.records.values().cloned().collect());
            }
            CatalogEvent::Get { name, resp } => {
                let _ = resp.send(state.records.get(&name).cloned());
            }
            CatalogEvent::Counts { resp } => {
                let _ = resp.send(state.counts());
            }
            CatalogEvent::LastUpdate { resp } => {
                let _ = resp.send(state.last_update);
            }
            CatalogEvent::UpdateJob {
                records,
                persist,
                resp,
            } => {
                let _ = resp.send(state.update_job(records, persist).await);
            }
            CatalogEvent::TakeBuildQueue { resp } => {
                let _ = resp.send(state.take_build_queue().await);
            }
            CatalogEvent::Shutdown => break,
        }
    }
}

impl CatalogState {
    async fn load(&mut self) {
        match self.store.load_all().await {
            Ok(records) => {
                self.records = records.into_iter().map(|r| (r.name.clone(), r)).collect();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load catalog from store");
            }
        }
        match self.store.load_last_update_time().await {
            Ok(t) => self.last_update = t,
            Err(e) => {
                tracing::error!(error = %e, "failed to load last update time");
            }
        }
    }

    async fn replace_all(&mut self, records: Vec<PackageRecord>) -> Result<(), CatalogError> {
        self.records = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        let sorted: Vec<PackageRecord> = self.records.values().cloned().collect();
        self.store.save_all(&sorted).await?;
        self.touch(true).await?;
        Ok(())
    }

    async fn update_job(
        &mut self,
        records: Vec<PackageRecord>,
        persist: bool,
    ) -> Result<(), CatalogError> {
        for record in records {
            if persist {
                self.store.save_one(&record).await?;
            }
            self.records.insert(record.name.clone(), record);
        }
        self.touch(persist).await?;
        Ok(())
    }

    async fn take_build_queue(&mut self) -> Result<Vec<BuildJob>, CatalogError> {
        let mut jobs = queue::group_buildable(self.records.values());
        for job in &mut jobs {
            for record in &mut job.records {
                record.status = PackageStatus::Queued;
                self.store.save_one(record).await?;
                self.records.insert(record.name.clone(), record.clone());
            }
        }
        self.touch(true).await?;
        Ok(jobs)
    }

    async fn touch(&mut self, persist: bool) -> Result<(), CatalogError> {
        let now = Utc::now();
        self.last_update = Some(now);
        if persist {
            self.store.save_last_update_time(now).await?;
        }
        Ok(())
    }

    fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            match record.status {
                PackageStatus::Stale => counts.stale += 1,
                PackageStatus::Missing => counts.missing += 1,
                // The dashboard folds Uptodate into the built column.
                PackageStatus::Built | PackageStatus::Uptodate => counts.built += 1,
                PackageStatus::Error => counts.error += 1,
                PackageStatus::Queued => counts.queued += 1,
                PackageStatus::Building => counts.building += 1,
            }
            if record.last_build_status == Some(PackageStatus::Error) {
                counts.error += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(name: &str, status: PackageStatus) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: "1.0-1".to_string(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replace_all_sorts_and_persists() {
        let catalog = CatalogHandle::spawn(Box::new(MemoryStore::new()));
        catalog
            .replace_all(vec![
                record("zsh", PackageStatus::Uptodate),
                record("bash", PackageStatus::Stale),
            ])
            .await
            .unwrap();

        let snapshot = catalog.snapshot().await.unwrap();
        let names: Vec<&str> = snapshot.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "zsh"]);
        assert!(catalog.last_update().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_take_build_queue_marks_queued() {
        let catalog = CatalogHandle::spawn(Box::new(MemoryStore::new()));
        catalog
            .replace_all(vec![
                record("bash", PackageStatus::Stale),
                record("jq", PackageStatus::Missing),
                record("zsh", PackageStatus::Uptodate),
            ])
            .await
            .unwrap();

        let jobs = catalog.take_build_queue().await.unwrap();
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            for r in &job.records {
                assert_eq!(r.status, PackageStatus::Queued);
            }
        }

        assert_eq!(
            catalog.get("bash").await.unwrap().unwrap().status,
            PackageStatus::Queued
        );
        assert_eq!(
            catalog.get("zsh").await.unwrap().unwrap().status,
            PackageStatus::Uptodate
        );
    }

    #[tokio::test]
    async fn test_update_job_is_atomic_per_message() {
        let catalog = CatalogHandle::spawn(Box::new(MemoryStore::new()));
        catalog
            .replace_all(vec![
                record("libfoo", PackageStatus::Queued),
                record("libfoo-dev", PackageStatus::Queued),
            ])
            .await
            .unwrap();

        let mut updated = catalog.snapshot().await.unwrap();
        for r in &mut updated {
            r.status = PackageStatus::Building;
        }
        catalog.update_job(updated, false).await.unwrap();

        let snapshot = catalog.snapshot().await.unwrap();
        assert!(snapshot
            .iter()
            .all(|r| r.status == PackageStatus::Building));
    }

    #[tokio::test]
    async fn test_counts_fold_uptodate_into_built() {
        let catalog = CatalogHandle::spawn(Box::new(MemoryStore::new()));
        let mut errored = record("broken", PackageStatus::Uptodate);
        errored.last_build_status = Some(PackageStatus::Error);
        catalog
            .replace_all(vec![
                record("bash", PackageStatus::Uptodate),
                record("jq", PackageStatus::Built),
                errored,
            ])
            .await
            .unwrap();

        let counts = catalog.counts().await.unwrap();
        assert_eq!(counts.built, 3);
        assert_eq!(counts.error, 1);
    }
}
