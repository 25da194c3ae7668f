//! Scheduler-facing orchestration.
//!
//! The durable scheduler (an external collaborator) calls two entry points
//! on its own cadence: [`Engine::run_fetch_cycle`] and
//! [`Engine::run_build_cycle`]. Per-job build failures are recorded in the
//! catalog and never abort a cycle; only infrastructure failures (index
//! fetch, store, container engine) surface as a [`CycleError`] for the
//! scheduler to retry.

use std::sync::Arc;

use thiserror::Error;

use crate::build::{pool, Executor};
use crate::catalog::{CatalogError, CatalogHandle};
use crate::config::Config;
use crate::index::FetchError;
use crate::reconcile;
use crate::runtime::{ContainerRuntime, ExecStream, RuntimeError};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("index fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Engine {
    config: Config,
    catalog: CatalogHandle,
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
}

impl Engine {
    pub fn new(config: Config, catalog: CatalogHandle, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            catalog,
            runtime,
            client: reqwest::Client::new(),
        }
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    /// One fetch cycle: load all indices, reconcile against the previous
    /// catalog snapshot, and replace the catalog wholesale.
    pub async fn run_fetch_cycle(&self) -> Result<(), CycleError> {
        let previous = self.catalog.snapshot().await?;
        let next = reconcile::reconcile(
            &self.client,
            &self.config.internal_sources,
            &self.config.external_sources,
            &previous,
        )
        .await?;
        tracing::info!(packages = next.len(), "reconciliation complete");
        self.catalog.replace_all(next).await?;
        Ok(())
    }

    /// One build cycle: drain the current build queue through the container
    /// pool. A cycle with nothing to build is a no-op.
    pub async fn run_build_cycle(&self) -> Result<(), CycleError> {
        let jobs = self.catalog.take_build_queue().await?;
        if jobs.is_empty() {
            tracing::info!("build queue is empty, nothing to do");
            return Ok(());
        }
        tracing::info!(jobs = jobs.len(), "starting build cycle");

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;

        // Leftover containers from a crashed cycle would collide on name.
        for index in 0..self.config.containers {
            let name = self.container_name(index);
            let _ = self.runtime.remove_container(&name, true).await;
        }

        let mut containers = Vec::with_capacity(self.config.containers);
        for index in 0..self.config.containers {
            let name = self.container_name(index);
            let id = self
                .runtime
                .create_container(
                    &name,
                    &self.config.build_image,
                    &self.config.staging_dir,
                    &self.config.container_workdir,
                )
                .await?;
            self.runtime.start_container(&id).await?;
            containers.push(id);
        }

        let executor = Arc::new(Executor::new(
            &self.config,
            self.catalog.clone(),
            Arc::clone(&self.runtime),
        ));
        pool::run_pool(&containers, jobs, move |container, job| {
            let executor = Arc::clone(&executor);
            async move { executor.build_job(&container, job).await }
        })
        .await;

        for id in &containers {
            if let Err(e) = self.runtime.stop_container(id).await {
                tracing::error!(container = %id, error = %e, "failed to stop build container");
            }
            if let Err(e) = self.runtime.remove_container(id, false).await {
                tracing::error!(container = %id, error = %e, "failed to remove build container");
            }
        }
        tracing::info!("build cycle finished");
        Ok(())
    }

    /// Pull the upstream base image, run the setup command inside it, and
    /// commit the result as the build image the pool containers run.
    pub async fn refresh_base_image(&self) -> Result<(), CycleError> {
        let name = format!("{}-image-refresh", self.config.container_prefix);
        let _ = self.runtime.remove_container(&name, true).await;
        let _ = self.runtime.remove_image(&self.config.build_image).await;

        tracing::info!(image = %self.config.base_image, "pulling base image");
        self.runtime.pull_image(&self.config.base_image).await?;

        let id = self
            .runtime
            .create_container(
                &name,
                &self.config.base_image,
                &self.config.staging_dir,
                &self.config.container_workdir,
            )
            .await?;
        self.runtime.start_container(&id).await?;

        let mut stream = self
            .runtime
            .exec(&id, &self.config.image_setup_command)
            .await?;
        stream.drain().await?;

        self.runtime.stop_container(&id).await?;
        self.runtime.commit(&id, &self.config.build_image).await?;
        self.runtime.remove_container(&id, false).await?;
        tracing::info!(image = %self.config.build_image, "build image refreshed");
        Ok(())
    }

    fn container_name(&self, index: usize) -> String {
        format!("{}-{}", self.config.container_prefix, index)
    }
}
