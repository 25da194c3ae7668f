//! Container Build Executor.
//!
//! Runs one build job inside its worker's container: fetch the exact source
//! version into an isolated temp directory under the shared bind mount, run
//! the selected build-command variant against the `.dsc`, watch for
//! completion under a watchdog, classify and relocate the artifacts, and
//! update every record in the job. All failure branches funnel through one
//! routine so the bookkeeping (Error status, attempt counter, temp-dir
//! removal) is identical no matter which step failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::{CatalogError, CatalogHandle, PackageRecord, PackageStatus};
use crate::config::{BuildCommands, Config};
use crate::queue::BuildJob;
use crate::runtime::{ContainerRuntime, ExecStream, RuntimeError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build setup failed: {0}")]
    Setup(#[from] RuntimeError),

    #[error("build timed out after {checks} watchdog checks")]
    Timeout { checks: u32 },

    #[error("build completed without producing a .deb")]
    ArtifactMissing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Which build command a job gets, per the retry heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildVariant {
    /// Link-time-optimized build (default).
    Lto,
    /// Non-LTO optimized build.
    Plain,
    /// Re-fetch a previously built artifact set instead of rebuilding.
    Reuse,
}

impl BuildVariant {
    /// Shell fragment executed against the fetched source directory.
    pub fn command(self, commands: &BuildCommands) -> String {
        match self {
            Self::Lto => format!("{} *.dsc", commands.lto),
            Self::Plain => format!("{} *.dsc", commands.plain),
            Self::Reuse => commands.reuse.clone(),
        }
    }
}

/// Pick the build-command variant for a job's lead record. First match wins:
/// blocklisted names never get LTO; repeated failures after a success
/// re-fetch instead of rebuilding; any failure retries without LTO on the
/// theory that the optimized path caused it.
pub fn select_variant(record: &PackageRecord, lto_blocklist: &[String]) -> BuildVariant {
    if lto_blocklist.iter().any(|name| name == &record.name) {
        return BuildVariant::Plain;
    }
    if record.build_attempts > 2 && record.last_build_status == Some(PackageStatus::Built) {
        return BuildVariant::Reuse;
    }
    if record.build_attempts > 0 && record.last_build_status == Some(PackageStatus::Error) {
        return BuildVariant::Plain;
    }
    BuildVariant::Lto
}

/// Per-cycle build executor, shared by every worker.
pub struct Executor {
    catalog: CatalogHandle,
    runtime: Arc<dyn ContainerRuntime>,
    commands: BuildCommands,
    staging_dir: PathBuf,
    deb_output_dir: PathBuf,
    build_log_dir: PathBuf,
    lto_blocklist: Vec<String>,
    watchdog_interval: Duration,
    watchdog_checks: u32,
}

impl Executor {
    pub fn new(
        config: &Config,
        catalog: CatalogHandle,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            catalog,
            runtime,
            commands: config.build_commands.clone(),
            staging_dir: config.staging_dir.clone(),
            deb_output_dir: config.deb_output_dir.clone(),
            build_log_dir: config.build_log_dir.clone(),
            lto_blocklist: config.lto_blocklist.clone(),
            watchdog_interval: Duration::from_secs(config.watchdog_interval_secs),
            watchdog_checks: config.watchdog_checks,
        }
    }

    /// Run one job to completion inside `container`.
    ///
    /// Build failures are fully recorded (Error status, incremented attempt
    /// counter, temp dir removed) before the error is returned; the caller
    /// only logs it.
    pub async fn build_job(&self, container: &str, job: BuildJob) -> Result<(), BuildError> {
        let lead = job.records[0].clone();
        let target_version = job.target_version().to_string();

        // Local-only visibility update: the dashboard sees Building, the
        // store is not written until the outcome is known.
        let mut records = job.records.clone();
        for record in &mut records {
            record.status = PackageStatus::Building;
            record.last_build_version = target_version.clone();
        }
        self.catalog.update_job(records.clone(), false).await?;

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", lead.name))
            .tempdir_in(&self.staging_dir)?;
        // The container sees the bind mount root as its working directory,
        // so only the basename crosses the boundary.
        let basename = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self
            .run_build(container, &lead, &target_version, &basename, dir.path())
            .await
        {
            Ok(()) => {
                for record in &mut records {
                    record.status = PackageStatus::Uptodate;
                    record.version = target_version.clone();
                    record.pending_version.clear();
                    record.last_build_status = Some(PackageStatus::Built);
                    record.build_attempts = 0;
                }
                tracing::info!(package = %lead.name, version = %target_version, "build succeeded");
                self.catalog.update_job(records, true).await?;
                dir.close()?;
                Ok(())
            }
            Err(e) => {
                self.fail_job(records, dir, &e).await;
                Err(e)
            }
        }
    }

    async fn run_build(
        &self,
        container: &str,
        lead: &PackageRecord,
        target_version: &str,
        basename: &str,
        dir: &Path,
    ) -> Result<(), BuildError> {
        // Fetch the exact source version into the job directory.
        let fetch = format!(
            "cd {basename} && eatmydata apt-get source {}={} -y",
            lead.name, target_version
        );
        let mut stream = self.runtime.exec(container, &fetch).await?;
        stream.drain().await?;

        let variant = select_variant(lead, &self.lto_blocklist);
        let build = format!("cd {basename} && {}", variant.command(&self.commands));
        tracing::debug!(package = %lead.name, ?variant, "running build command");
        let mut stream = self.runtime.exec(container, &build).await?;

        let mut checks = 0u32;
        loop {
            match tokio::time::timeout(self.watchdog_interval, stream.drain()).await {
                // Output drained: one final classification decides.
                Ok(Ok(())) => {
                    if self.classify_artifacts(dir, &lead.name).await? {
                        return Ok(());
                    }
                    return Err(BuildError::ArtifactMissing);
                }
                Ok(Err(e)) => return Err(BuildError::Setup(e)),
                // Watchdog tick: the side observing completion (or giving
                // up) owns closing the stream.
                Err(_elapsed) => {
                    if self.classify_artifacts(dir, &lead.name).await? {
                        stream.terminate().await;
                        return Ok(());
                    }
                    checks += 1;
                    if checks >= self.watchdog_checks {
                        tracing::warn!(package = %lead.name, checks, "build watchdog expired");
                        stream.terminate().await;
                        return Err(BuildError::Timeout { checks });
                    }
                }
            }
        }
    }

    /// Sole writer of failure outcomes: remove the temp directory, log, and
    /// mark every record Error with an incremented attempt counter.
    async fn fail_job(
        &self,
        mut records: Vec<PackageRecord>,
        dir: tempfile::TempDir,
        error: &BuildError,
    ) {
        let name = records
            .first()
            .map(|r| r.name.clone())
            .unwrap_or_default();
        tracing::error!(package = %name, error = %error, "build failed");
        if let Err(e) = dir.close() {
            tracing::error!(package = %name, error = %e, "failed to remove build temp dir");
        }
        for record in &mut records {
            record.status = PackageStatus::Error;
            record.last_build_status = Some(PackageStatus::Error);
            record.build_attempts += 1;
        }
        if let Err(e) = self.catalog.update_job(records, true).await {
            tracing::error!(package = %name, error = %e, "failed to persist build failure");
        }
    }

    /// Inspect the job directory once: discard debug/source artifacts, move
    /// logs to the build-log directory and `.deb` files to the output
    /// directory (world-readable). Returns whether at least one `.deb` was
    /// produced. Safe to call repeatedly; already-moved files are simply no
    /// longer present.
    async fn classify_artifacts(&self, dir: &Path, package: &str) -> Result<bool, BuildError> {
        let mut found_deb = false;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            if file_name.contains("dbgsym") || file_name.contains("source") {
                tokio::fs::remove_file(&path).await?;
                continue;
            }

            match path.extension().and_then(|e| e.to_str()) {
                Some("log") => {
                    tokio::fs::create_dir_all(&self.build_log_dir).await?;
                    let dest = self.build_log_dir.join(format!("{package}_{file_name}"));
                    move_world_readable(&path, &dest).await?;
                }
                Some("deb") => {
                    tokio::fs::create_dir_all(&self.deb_output_dir).await?;
                    let dest = self.deb_output_dir.join(&file_name);
                    move_world_readable(&path, &dest).await?;
                    found_deb = true;
                }
                _ => {}
            }
        }
        Ok(found_deb)
    }
}

/// Move a finished artifact out of the staging area and open up its
/// permissions so the web server can hand it out.
async fn move_world_readable(src: &Path, dest: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => {}
        // Output directories commonly live on another filesystem.
        Err(_) => {
            tokio::fs::copy(src, dest).await?;
            tokio::fs::remove_file(src).await?;
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o777)).await?;
    }
    Ok(())
}
