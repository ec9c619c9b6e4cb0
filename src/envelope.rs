use serde_json::Value;

use crate::db::models::StoredNotification;
use crate::payload::PayloadError;

/// Where an envelope came from: the live LISTEN stream or a recovery scan
/// over the stored-notification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Live,
    Replay,
}

/// In-memory representation of a notification travelling through a worker.
///
/// An envelope is created from a received or replayed notification, handed
/// to exactly one dispatch, and dropped when that dispatch returns.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: String,
    pub payload: Value,
    pub source: Source,
    /// Migration identifier of the producing application at publish time,
    /// used for schema-evolution gating. Not interpreted beyond ordering.
    pub db_version: Option<String>,
}

impl Envelope {
    /// Build an envelope from a live server notification.
    pub fn from_live(channel: &str, raw_payload: &str) -> Result<Self, PayloadError> {
        let payload: Value = serde_json::from_str(raw_payload)?;
        if !payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let db_version = payload
            .get("db_version")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Envelope {
            channel: channel.to_string(),
            payload,
            source: Source::Live,
            db_version,
        })
    }

    /// Build a replay envelope from a stored row. The row's `db_version`
    /// column is authoritative over anything embedded in the payload.
    pub fn from_stored(row: &StoredNotification) -> Self {
        Envelope {
            channel: row.channel.clone(),
            payload: row.payload.clone(),
            source: Source::Replay,
            db_version: row.db_version.clone(),
        }
    }
}
