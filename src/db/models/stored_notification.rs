use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the stored-notification table.
///
/// A row exists iff a durable `NOTIFY` was committed (inserted atomically by
/// the producing transaction) and is deleted iff some worker completed its
/// callback for it. At most one worker holds the row lock at any instant.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredNotification {
    /// Primary key, monotonically increasing.
    pub id: i64,

    /// Channel the notification was published on.
    pub channel: String,

    /// Payload, byte-identical to the transient notification's payload.
    pub payload: serde_json::Value,

    /// Migration identifier of the producing application at publish time.
    /// A coordination artifact for deployers; the runtime only compares it
    /// against the configured minimum.
    pub db_version: Option<String>,

    /// When the producing transaction inserted the row.
    pub created_at: DateTime<Utc>,
}
