//! Periodic queue gauges.
//!
//! Publishes `<prefix>.queue_length` (stored rows not yet processed across
//! the channels this process listens to) and `<prefix>.processing_lag_ms`
//! (age of the oldest pending row, zero when none) through the `metrics`
//! facade. With no recorder installed the gauges are no-ops. The reads run
//! on their own pool connection and take no row locks, so they never starve
//! the listener loop.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::MetricsConfig;
use crate::db::repository::NotificationRepository;

pub fn spawn_reporter(
    pool: PgPool,
    config: &MetricsConfig,
    channels: Vec<String>,
    shutdown: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.interval_seconds);
    let queue_length_gauge = format!("{}.queue_length", config.prefix);
    let lag_gauge = format!("{}.processing_lag_ms", config.prefix);
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            match NotificationRepository::queue_stats(&pool, &channels).await {
                Ok(stats) => {
                    let lag_ms = stats
                        .oldest_created_at
                        .map(|oldest| (Utc::now() - oldest).num_milliseconds().max(0))
                        .unwrap_or(0);

                    metrics::gauge!(queue_length_gauge.clone())
                        .set(stats.queue_length as f64);
                    metrics::gauge!(lag_gauge.clone()).set(lag_ms as f64);

                    tracing::debug!(
                        "Queue depth {} across {} channel(s), lag {}ms",
                        stats.queue_length,
                        channels.len(),
                        lag_ms
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to read queue stats: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Metrics reporter shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
