use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::db::models::StoredNotification;
use crate::error::Result;

/// Snapshot of the stored queue for the channels one process listens to.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Count of stored rows not yet processed.
    pub queue_length: i64,
    /// Insertion time of the oldest pending row, if any.
    pub oldest_created_at: Option<DateTime<Utc>>,
}

/// Repository for the stored-notification table.
///
/// Implementation notes:
/// - Claiming locks the first matching row with
///   `FOR UPDATE SKIP LOCKED LIMIT 1`, so concurrent workers never block
///   each other and each row is executed by exactly one of them.
/// - The match is by `(channel, payload)` identity, not by row id: duplicate
///   payloads collapse to a single live delivery. Publishers who need every
///   event delivered embed a unique identifier in the payload. A recovery
///   scan, by contrast, visits every remaining row independently.
pub struct NotificationRepository;

impl NotificationRepository {
    /// Claim the first unlocked stored row matching the envelope, inside the
    /// caller's transaction. Returns `None` when every matching row is gone
    /// or locked by another worker (a claim miss).
    pub async fn claim(
        tx: &mut Transaction<'_, Postgres>,
        channel: &str,
        payload: &Value,
    ) -> Result<Option<StoredNotification>> {
        let row = sqlx::query_as::<_, StoredNotification>(
            r#"
            SELECT id, channel, payload, db_version, created_at
            FROM pgpubsub_notifications
            WHERE channel = $1 AND payload = $2
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(channel)
        .bind(payload)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    /// Delete the exact row previously claimed in this transaction.
    pub async fn delete(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pgpubsub_notifications WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Stream stored rows for one channel, oldest first, over the given
    /// connection. Rows arrive incrementally over the wire so memory stays
    /// bounded regardless of queue depth; the stream takes no locks.
    pub fn stream_channel<'a>(
        conn: &'a mut PgConnection,
        channel: &'a str,
    ) -> BoxStream<'a, sqlx::Result<StoredNotification>> {
        sqlx::query_as::<_, StoredNotification>(
            r#"
            SELECT id, channel, payload, db_version, created_at
            FROM pgpubsub_notifications
            WHERE channel = $1
            ORDER BY id
            "#,
        )
        .bind(channel)
        .fetch(conn)
    }

    /// Read queue depth and the oldest pending row across `channels` in one
    /// lightweight transaction. Takes no row locks.
    pub async fn queue_stats(pool: &PgPool, channels: &[String]) -> Result<QueueStats> {
        let (queue_length, oldest_created_at): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*), MIN(created_at)
                FROM pgpubsub_notifications
                WHERE channel = ANY($1)
                "#,
            )
            .bind(channels)
            .fetch_one(pool)
            .await?;

        Ok(QueueStats {
            queue_length,
            oldest_created_at,
        })
    }
}
