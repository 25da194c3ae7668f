//! Container runtime seam.
//!
//! The farm drives a pool of long-lived privileged containers through a
//! small surface: create/start/stop/remove, image pull/commit for the
//! base-image refresh path, and shell execs with an attached output stream.
//! [`DockerCli`] implements it over the `docker` command line; tests swap
//! in fakes.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command:?} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running exec inside a container.
#[async_trait]
pub trait ExecStream: Send {
    /// Drain the exec's output until the command exits.
    ///
    /// Must be cancellation-safe: the watchdog drops this future on every
    /// poll interval and calls it again, so an implementation may not lose
    /// buffered output across such a drop.
    async fn drain(&mut self) -> Result<(), RuntimeError>;

    /// Kill the exec and reap it. Idempotent.
    async fn terminate(&mut self);
}

/// Container engine operations the farm consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a stopped container that stays alive once started, with
    /// `host_dir` bind-mounted at `container_dir`. Returns the container id.
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        host_dir: &Path,
        container_dir: &str,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError>;

    /// Commit a running container to a new image reference.
    async fn commit(&self, id: &str, reference: &str) -> Result<(), RuntimeError>;

    /// Run a shell command inside a running container.
    async fn exec(
        &self,
        container: &str,
        command: &str,
    ) -> Result<Box<dyn ExecStream>, RuntimeError>;
}

/// `ContainerRuntime` over the `docker` (or `podman`) command line.
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["pull", image]).await.map(|_| ())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["rmi", "--force", image]).await.map(|_| ())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        host_dir: &Path,
        container_dir: &str,
    ) -> Result<String, RuntimeError> {
        let bind = format!("{}:{}", host_dir.display(), container_dir);
        self.run(&[
            "create",
            "--name",
            name,
            "--privileged",
            "--tty",
            "--workdir",
            container_dir,
            "--volume",
            &bind,
            image,
            // Keep the container running between execs.
            "tail",
            "-f",
            "/dev/null",
        ])
        .await
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", id]).await.map(|_| ())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id_or_name);
        self.run(&args).await.map(|_| ())
    }

    async fn commit(&self, id: &str, reference: &str) -> Result<(), RuntimeError> {
        self.run(&["commit", id, reference]).await.map(|_| ())
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
    ) -> Result<Box<dyn ExecStream>, RuntimeError> {
        let full = format!(
            "{} exec {} sh -c {}",
            self.program, container, command
        );
        let child = Command::new(&self.program)
            .args(["exec", container, "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: full,
                source,
            })?;
        Ok(Box::new(ProcessExec { child }))
    }
}

/// Exec stream backed by a local child process.
struct ProcessExec {
    child: Child,
}

#[async_trait]
impl ExecStream for ProcessExec {
    async fn drain(&mut self) -> Result<(), RuntimeError> {
        // Read incrementally so a cancelled poll resumes cleanly.
        if let Some(stdout) = self.child.stdout.as_mut() {
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
            }
            self.child.stdout = None;
        }
        self.child.wait().await?;
        Ok(())
    }

    async fn terminate(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn spawn_shell(script: &str) -> ProcessExec {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ProcessExec { child }
    }

    #[tokio::test]
    async fn test_drain_completes_on_exit() {
        let mut exec = spawn_shell("echo hello; echo world");
        exec.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_resumes_after_cancel() {
        let mut exec = spawn_shell("echo start; sleep 0.2; echo done");
        // First poll is abandoned mid-stream, second finishes the job.
        let _ = tokio::time::timeout(Duration::from_millis(20), exec.drain()).await;
        exec.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_kills_long_runner() {
        let mut exec = spawn_shell("sleep 60");
        let started = Instant::now();
        exec.terminate().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        // Idempotent.
        exec.terminate().await;
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let cli = DockerCli::with_program("false");
        let err = cli.pull_image("whatever").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_run_reports_missing_program() {
        let cli = DockerCli::with_program("definitely-not-a-real-binary");
        let err = cli.pull_image("whatever").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
