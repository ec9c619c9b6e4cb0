use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::worker::WorkerContext;

/// What to do when a worker exits abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Spawn a replacement worker with the same channel set (default).
    OnFailure,
    /// Record the failure and exit once the pool empties.
    Never,
}

/// Starts N workers and keeps the subscription alive across worker crashes.
///
/// Individual worker failures do not propagate out of `run` when restart is
/// enabled; the supervisor only returns an error for its own startup
/// problems.
pub struct Supervisor {
    ctx: WorkerContext,
    worker_count: usize,
    restart_policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(ctx: WorkerContext, worker_count: usize, restart_policy: RestartPolicy) -> Self {
        Self {
            ctx,
            worker_count: worker_count.max(1),
            restart_policy,
        }
    }

    /// Handle for broadcasting shutdown to every worker.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.ctx.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let mut workers: JoinSet<(usize, Result<()>)> = JoinSet::new();
        for index in 0..self.worker_count {
            self.spawn_worker(&mut workers, index);
        }

        let mut shutdown = self.ctx.shutdown.subscribe();
        let mut draining = false;
        let mut failures = 0usize;

        while let Some(joined) = workers.join_next().await {
            if shutdown.try_recv().is_ok() {
                draining = true;
            }

            let (index, abnormal) = match joined {
                Ok((index, Ok(()))) => {
                    tracing::info!("Worker {} exited cleanly", index);
                    (index, false)
                }
                Ok((index, Err(e))) => {
                    tracing::warn!("Worker {} failed: {}", index, e);
                    (index, true)
                }
                Err(join_error) => {
                    // Only reachable on task abort; panics are caught inside
                    // the task so they stay restartable.
                    tracing::error!("Worker task aborted: {}", join_error);
                    failures += 1;
                    continue;
                }
            };

            if abnormal {
                failures += 1;
                if self.restart_policy == RestartPolicy::OnFailure && !draining {
                    // Brief pause so a persistently failing dependency (DB
                    // down) doesn't turn into a hot restart loop; stays well
                    // under one poll cycle.
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    tracing::info!("Restarting worker {}", index);
                    self.spawn_worker(&mut workers, index);
                }
            }
        }

        if failures > 0 {
            tracing::warn!(
                "Supervisor exiting; {} worker failure(s) observed",
                failures
            );
        } else {
            tracing::info!("Supervisor exiting; all workers done");
        }

        Ok(())
    }

    fn spawn_worker(&self, workers: &mut JoinSet<(usize, Result<()>)>, index: usize) {
        let worker = self.ctx.worker(index);
        workers.spawn(async move {
            match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(result) => (index, result),
                Err(_panic) => (
                    index,
                    Err(Error::Internal(anyhow::anyhow!("worker {} panicked", index))),
                ),
            }
        });
    }
}
