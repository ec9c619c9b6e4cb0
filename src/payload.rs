//! Wire format for notification payloads.
//!
//! Payloads are UTF-8 JSON objects small enough for PostgreSQL's NOTIFY
//! limit. Two shapes exist:
//! - custom: `{ "kwargs": {...}, "context": {...} }`
//! - trigger: `{ "app": "...", "model": "...", "old": <row|null>,
//!   "new": <row|null>, "db_version": "...", "context": {...}, "extras": {...} }`
//!
//! Trigger rows arrive in the fixtures-style `{model, pk, fields}` shape and
//! are turned into application types by a [`RowDecoder`].

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

/// PostgreSQL rejects NOTIFY payloads larger than this (bytes).
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid payload JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("trigger row is not in the expected {{model, pk, fields}} shape: {0}")]
    RowShape(String),
}

/// Custom payload: keyword arguments plus an optional context object.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomPayload {
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub context: Option<Value>,
}

/// Trigger payload emitted by a database-side trigger on INSERT/UPDATE/DELETE.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerPayload {
    pub app: String,
    pub model: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
    #[serde(default)]
    pub db_version: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub extras: Option<Value>,
}

impl CustomPayload {
    pub fn parse(payload: &Value) -> Result<Self, PayloadError> {
        if !payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        Ok(serde_json::from_value(payload.clone())?)
    }
}

impl TriggerPayload {
    pub fn parse(payload: &Value) -> Result<Self, PayloadError> {
        if !payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Cross-cutting payload fields surfaced to a callback when the deployment
/// opts in (`PGPUBSUB_PASS_CONTEXT_TO_LISTENERS` / `..._EXTRAS_...`).
#[derive(Debug, Clone, Default)]
pub struct CallbackContext {
    pub context: Option<Value>,
    pub extras: Option<Value>,
}

/// Turns a raw trigger row (`old`/`new` entry of a trigger payload) into an
/// application row type.
pub trait RowDecoder: Send + Sync + 'static {
    type Row: Send;

    fn decode(&self, raw: &Value) -> Result<Self::Row, PayloadError>;
}

/// Fixtures-style row as serialized by the producing side.
#[derive(Debug, Clone, Deserialize)]
struct FixtureRow {
    #[allow(dead_code)]
    model: String,
    pk: Value,
    fields: Map<String, Value>,
}

/// Default [`RowDecoder`]: merges `pk` into `fields` under a configurable
/// key (`id` unless overridden) and deserializes the result into `T`.
pub struct FixtureDecoder<T> {
    pk_field: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FixtureDecoder<T> {
    pub fn new() -> Self {
        Self {
            pk_field: "id",
            _marker: PhantomData,
        }
    }

    /// Use a primary-key field name other than `id`.
    pub fn with_pk_field(pk_field: &'static str) -> Self {
        Self {
            pk_field,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FixtureDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RowDecoder for FixtureDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Row = T;

    fn decode(&self, raw: &Value) -> Result<T, PayloadError> {
        let fixture: FixtureRow = serde_json::from_value(raw.clone())
            .map_err(|e| PayloadError::RowShape(e.to_string()))?;

        let mut fields = fixture.fields;
        // The pk lives outside `fields` in the fixture dialect; a field with
        // the same name wins if the producer serialized both.
        fields
            .entry(self.pk_field.to_string())
            .or_insert(fixture.pk);

        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}
