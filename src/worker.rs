//! The worker run loop.
//!
//! A worker owns one listening connection and one callback execution context:
//! it processes live notifications strictly one at a time, with parallelism
//! obtained by running multiple workers. There is deliberately no in-process
//! queue between poll and dispatch; for durable channels the stored row and
//! its lock are the queue.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::PgPool;
use tokio::sync::broadcast;

use crate::channel::ChannelRegistry;
use crate::db::repository::NotificationRepository;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::session::{ListenSession, LiveNotification, Polled};

/// Everything a worker needs, cloned once per spawned worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub database_url: String,
    pub registry: Arc<ChannelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    /// Canonical channel names this worker subscribes to.
    pub channels: Vec<String>,
    /// Whether to drain stored rows before touching the live stream.
    pub recover: bool,
    pub poll_interval: Duration,
    pub shutdown: broadcast::Sender<()>,
}

impl WorkerContext {
    pub fn worker(&self, index: usize) -> Worker {
        Worker {
            index,
            ctx: self.clone(),
        }
    }
}

pub struct Worker {
    index: usize,
    ctx: WorkerContext,
}

impl Worker {
    /// Run until shutdown is broadcast or a fatal session error occurs.
    ///
    /// Connection-level errors propagate as `Err` so the supervisor can
    /// restart the worker; errors confined to a single envelope are logged
    /// and the loop continues.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.subscribe();

        let mut session = ListenSession::connect(&self.ctx.database_url).await?;
        let channels: Vec<&str> = self.ctx.channels.iter().map(String::as_str).collect();
        session.subscribe(&channels).await?;

        if self.ctx.recover && !self.recover(&mut shutdown).await? {
            session.close().await;
            return Ok(());
        }

        tracing::info!("Worker {} entering poll loop", self.index);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Worker {} received shutdown signal", self.index);
                    break;
                }
                polled = session.poll(self.ctx.poll_interval) => {
                    match polled? {
                        Polled::Timeout => {
                            tracing::debug!(
                                "Worker {} idle on {:?}",
                                self.index,
                                self.ctx.channels
                            );
                        }
                        Polled::Notification(notification) => {
                            self.handle_live(notification).await?;
                        }
                    }
                }
            }
        }

        session.close().await;
        tracing::info!("Worker {} exited", self.index);
        Ok(())
    }

    async fn handle_live(&self, notification: LiveNotification) -> Result<()> {
        tracing::debug!(
            "Worker {} received notification on {} from backend {}",
            self.index,
            notification.channel,
            notification.process_id
        );

        let descriptor = match self.ctx.registry.resolve(&notification.channel) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                tracing::warn!(
                    "Dropping notification on unregistered channel {}",
                    notification.channel
                );
                return Ok(());
            }
        };

        let envelope = match Envelope::from_live(&notification.channel, &notification.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed notification on {}: {}",
                    notification.channel,
                    e
                );
                return Ok(());
            }
        };

        if descriptor.durable() {
            self.deliver_durable(envelope).await
        } else {
            match self.ctx.dispatcher.dispatch(descriptor, &envelope).await {
                DispatchOutcome::Failed(e) => {
                    tracing::warn!(
                        "Callback failed for transient notification on {}: {:?}",
                        envelope.channel,
                        e
                    );
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    /// Deliver one envelope for a durable channel under the claim protocol:
    /// lock-and-skip the first stored row matching `(channel, payload)`,
    /// run the callback inside the transaction, then delete the exact row
    /// claimed and commit. A callback error aborts the transaction so the
    /// row survives for another worker or a later recovery pass.
    async fn deliver_durable(&self, envelope: Envelope) -> Result<()> {
        let descriptor = self.ctx.registry.resolve(&envelope.channel)?;

        let mut tx = self.ctx.pool.begin().await?;
        let claimed =
            NotificationRepository::claim(&mut tx, &envelope.channel, &envelope.payload).await?;

        let row = match claimed {
            Some(row) => row,
            None => {
                // Another worker already processed this notification, or a
                // recovery scan got there first.
                tx.commit().await?;
                tracing::debug!(
                    "Worker {} claim miss on {} ({:?})",
                    self.index,
                    envelope.channel,
                    envelope.source
                );
                return Ok(());
            }
        };

        // The stored row's column is authoritative for version gating.
        let mut envelope = envelope;
        if row.db_version.is_some() {
            envelope.db_version = row.db_version.clone();
        }

        match self.ctx.dispatcher.dispatch(descriptor, &envelope).await {
            DispatchOutcome::Completed => {
                NotificationRepository::delete(&mut tx, row.id).await?;
                tx.commit().await?;
            }
            DispatchOutcome::FilteredOut | DispatchOutcome::Skipped => {
                // Leave the row for another process or a future deployment.
                tx.commit().await?;
            }
            DispatchOutcome::Failed(e) => {
                tx.rollback().await?;
                tracing::warn!(
                    "Callback failed on durable channel {}; row {} retained for retry: {:?}",
                    envelope.channel,
                    row.id,
                    e
                );
            }
        }

        Ok(())
    }

    /// Replay stored rows for the durable channels in this worker's set,
    /// oldest first, each through the same claim protocol as live delivery.
    /// The shared claim dedups naturally against concurrent live processing.
    ///
    /// Returns `false` when a shutdown signal interrupted the scan.
    async fn recover(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool> {
        let durable = self.ctx.registry.durable_channels(&self.ctx.channels);

        for channel in durable {
            let mut replayed = 0usize;
            let mut conn = self.ctx.pool.acquire().await?;
            let mut rows = NotificationRepository::stream_channel(&mut *conn, channel);

            while let Some(row) = rows.try_next().await.map_err(Error::Database)? {
                if shutdown.try_recv().is_ok() {
                    tracing::info!(
                        "Worker {} abandoning recovery of {} on shutdown",
                        self.index,
                        channel
                    );
                    return Ok(false);
                }

                let envelope = Envelope::from_stored(&row);
                self.deliver_durable(envelope).await?;
                replayed += 1;
            }

            tracing::info!(
                "Worker {} recovery scanned {} stored notification(s) on {}",
                self.index,
                replayed,
                channel
            );
        }

        Ok(true)
    }
}
