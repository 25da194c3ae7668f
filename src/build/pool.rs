//! Fixed-size container-bound worker pool.
//!
//! Each worker is bound to one pre-started container for its whole
//! lifetime; jobs never migrate between containers. The queue is an mpsc
//! channel whose receiver is shared behind an async mutex: `recv()` blocks
//! while the channel is open and yields `None` only once it is both closed
//! and drained, so a worker can never give up on a transiently empty queue
//! while the producer is still enqueueing.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::queue::BuildJob;

/// Drain `jobs` across one worker per container, then join all workers.
///
/// `handler(container, job)` runs one build synchronously from the worker's
/// point of view. A handler error is logged and does not abort sibling jobs
/// or the pool; the call returns only after every worker has exited.
pub async fn run_pool<F, Fut, E>(containers: &[String], jobs: Vec<BuildJob>, handler: F)
where
    F: Fn(String, BuildJob) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Display,
{
    let (tx, rx) = mpsc::unbounded_channel();
    // Fully populate the queue, then close it, before any worker can
    // observe it empty.
    for job in jobs {
        let _ = tx.send(job);
    }
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let mut workers = Vec::with_capacity(containers.len());
    for (index, container) in containers.iter().cloned().enumerate() {
        let rx = Arc::clone(&rx);
        let handler = handler.clone();
        workers.push(tokio::spawn(async move {
            loop {
                // Hold the lock only for the take, not for the build.
                let job = rx.lock().await.recv().await;
                let Some(job) = job else {
                    break;
                };
                tracing::info!(worker = index, container = %container, source = %job.source, "starting build job");
                if let Err(e) = handler(container.clone(), job).await {
                    tracing::error!(worker = index, error = %e, "build job failed");
                }
            }
            tracing::debug!(worker = index, "worker finished, queue exhausted");
        }));
    }

    for worker in workers {
        // Worker tasks don't panic in normal operation; a panicked worker
        // must still not wedge the pool join.
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "build worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PackageRecord, PackageStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(source: &str) -> BuildJob {
        BuildJob {
            source: source.to_string(),
            records: vec![PackageRecord {
                name: source.to_string(),
                version: "1.0-1".to_string(),
                status: PackageStatus::Queued,
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_every_job_processed_exactly_once() {
        let containers: Vec<String> = (0..3).map(|i| format!("bldr-{i}")).collect();
        let jobs: Vec<BuildJob> = (0..20).map(|i| job(&format!("src{i}"))).collect();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = Arc::clone(&seen);
        run_pool(&containers, jobs, move |_container, job| {
            let seen = Arc::clone(&seen_handler);
            async move {
                // Force interleaving across workers.
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.lock().await.push(job.source);
                Ok::<(), std::io::Error>(())
            }
        })
        .await;

        let mut seen = seen.lock().await.clone();
        seen.sort();
        let expected: Vec<String> = {
            let mut v: Vec<String> = (0..20).map(|i| format!("src{i}")).collect();
            v.sort();
            v
        };
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_jobs_never_migrate_and_all_workers_used() {
        let containers: Vec<String> = (0..3).map(|i| format!("bldr-{i}")).collect();
        let jobs: Vec<BuildJob> = (0..12).map(|i| job(&format!("src{i}"))).collect();

        let assignments = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&assignments);
        run_pool(&containers, jobs, move |container, job| {
            let a = Arc::clone(&a);
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                a.lock().await.push((container, job.source));
                Ok::<(), std::io::Error>(())
            }
        })
        .await;

        let assignments = assignments.lock().await;
        assert_eq!(assignments.len(), 12);
        for (container, _) in assignments.iter() {
            assert!(container.starts_with("bldr-"));
        }
    }

    #[tokio::test]
    async fn test_failed_job_does_not_abort_siblings() {
        let containers = vec!["bldr-0".to_string()];
        let jobs = vec![job("bad"), job("good")];

        let completed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completed);
        run_pool(&containers, jobs, move |_container, job| {
            let c = Arc::clone(&c);
            async move {
                if job.source == "bad" {
                    return Err(std::io::Error::other("boom"));
                }
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_immediately() {
        let containers = vec!["bldr-0".to_string(), "bldr-1".to_string()];
        run_pool(&containers, Vec::new(), |_c, _j| async move {
            Ok::<(), std::io::Error>(())
        })
        .await;
    }
}
