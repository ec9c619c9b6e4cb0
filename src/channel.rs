//! Channel descriptors and the registry mapping channel names to callbacks.
//!
//! Callbacks are registered explicitly at process initialization through
//! [`ChannelRegistry::builder`]; the built registry is immutable for the
//! lifetime of the workers and shared read-only between them.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::EnvelopeFilter;
use crate::payload::{CallbackContext, CustomPayload, PayloadError, RowDecoder, TriggerPayload};

/// Discriminates how a channel's payloads are deserialized before the
/// callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Custom,
    Trigger,
}

/// Why a callback invocation did not complete.
#[derive(Debug)]
pub enum CallbackError {
    /// The payload could not be decoded into the callback's declared types.
    /// The envelope is dropped; a durable row is released for a future
    /// deployment that may understand the shape.
    Decode(PayloadError),
    /// The callback itself returned an error. A durable claim transaction
    /// is aborted so the row survives for another worker.
    Failed(anyhow::Error),
}

/// Type-erased callback handle stored in a descriptor. Implementations
/// deserialize the payload for their kind and invoke the user handler.
#[async_trait]
pub trait ErasedCallback: Send + Sync {
    async fn invoke(
        &self,
        payload: &Value,
        ctx: CallbackContext,
    ) -> std::result::Result<(), CallbackError>;
}

/// Static description of one channel: its PostgreSQL channel name, whether
/// notifications are mirrored into the stored-notification table, the
/// payload kind, and the callback handle.
#[derive(Clone)]
pub struct ChannelDescriptor {
    name: String,
    durable: bool,
    payload_kind: PayloadKind,
    callback: Arc<dyn ErasedCallback>,
}

impl ChannelDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload_kind
    }

    pub fn callback(&self) -> &Arc<dyn ErasedCallback> {
        &self.callback
    }
}

impl std::fmt::Debug for ChannelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDescriptor")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("payload_kind", &self.payload_kind)
            .finish()
    }
}

/// Channel names are used verbatim in `LISTEN` statements. Restricting them
/// to plain PostgreSQL identifiers removes any injection surface.
fn is_valid_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct CustomCallback<Args, F> {
    handler: F,
    _marker: PhantomData<fn(Args)>,
}

#[async_trait]
impl<Args, F, Fut> ErasedCallback for CustomCallback<Args, F>
where
    Args: DeserializeOwned + Send,
    F: Fn(Args, CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn invoke(
        &self,
        payload: &Value,
        ctx: CallbackContext,
    ) -> std::result::Result<(), CallbackError> {
        let parsed = CustomPayload::parse(payload).map_err(CallbackError::Decode)?;
        let args: Args = serde_json::from_value(Value::Object(parsed.kwargs))
            .map_err(|e| CallbackError::Decode(PayloadError::Json(e)))?;

        (self.handler)(args, ctx).await.map_err(CallbackError::Failed)
    }
}

struct TriggerCallback<D, F> {
    decoder: D,
    handler: F,
}

#[async_trait]
impl<D, F, Fut> ErasedCallback for TriggerCallback<D, F>
where
    D: RowDecoder,
    F: Fn(Option<D::Row>, Option<D::Row>, CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn invoke(
        &self,
        payload: &Value,
        ctx: CallbackContext,
    ) -> std::result::Result<(), CallbackError> {
        let parsed = TriggerPayload::parse(payload).map_err(CallbackError::Decode)?;

        let old = parsed
            .old
            .as_ref()
            .map(|raw| self.decoder.decode(raw))
            .transpose()
            .map_err(CallbackError::Decode)?;
        let new = parsed
            .new
            .as_ref()
            .map(|raw| self.decoder.decode(raw))
            .transpose()
            .map_err(CallbackError::Decode)?;

        (self.handler)(old, new, ctx).await.map_err(CallbackError::Failed)
    }
}

/// Read-only map from channel name to descriptor, plus the named filters a
/// deployment may select via `PGPUBSUB_LISTENER_FILTER`.
pub struct ChannelRegistry {
    channels: BTreeMap<String, ChannelDescriptor>,
    filters: BTreeMap<String, Arc<dyn EnvelopeFilter>>,
}

impl ChannelRegistry {
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder {
            channels: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }

    /// Look up a descriptor by its canonical name, or by a fully-qualified
    /// dotted path whose final segment is the canonical name.
    pub fn resolve(&self, name: &str) -> Result<&ChannelDescriptor> {
        if let Some(descriptor) = self.channels.get(name) {
            return Ok(descriptor);
        }
        if let Some(tail) = name.rsplit('.').next() {
            if tail != name {
                if let Some(descriptor) = self.channels.get(tail) {
                    return Ok(descriptor);
                }
            }
        }
        Err(Error::UnknownChannel(name.to_string()))
    }

    /// All registered canonical channel names, in stable order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// The durable subset of `names`.
    pub fn durable_channels<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        names
            .iter()
            .filter(|name| {
                self.resolve(name)
                    .map(ChannelDescriptor::durable)
                    .unwrap_or(false)
            })
            .map(String::as_str)
            .collect()
    }

    pub fn filter(&self, name: &str) -> Option<Arc<dyn EnvelopeFilter>> {
        self.filters.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct ChannelRegistryBuilder {
    channels: BTreeMap<String, ChannelDescriptor>,
    filters: BTreeMap<String, Arc<dyn EnvelopeFilter>>,
}

impl ChannelRegistryBuilder {
    /// Register a custom channel. `Args` is the callback's declared keyword
    /// parameter set; the payload's `kwargs` object is deserialized into it.
    pub fn custom<Args, F, Fut>(
        mut self,
        name: &str,
        durable: bool,
        handler: F,
    ) -> Result<Self>
    where
        Args: DeserializeOwned + Send + 'static,
        F: Fn(Args, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(
            name,
            durable,
            PayloadKind::Custom,
            Arc::new(CustomCallback {
                handler,
                _marker: PhantomData,
            }),
        )?;
        Ok(self)
    }

    /// Register a trigger channel. `decoder` turns the payload's `old`/`new`
    /// fixture rows into the handler's row type.
    pub fn trigger<D, F, Fut>(
        mut self,
        name: &str,
        durable: bool,
        decoder: D,
        handler: F,
    ) -> Result<Self>
    where
        D: RowDecoder,
        F: Fn(Option<D::Row>, Option<D::Row>, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(
            name,
            durable,
            PayloadKind::Trigger,
            Arc::new(TriggerCallback { decoder, handler }),
        )?;
        Ok(self)
    }

    /// Register a named filter selectable via `PGPUBSUB_LISTENER_FILTER`.
    pub fn filter(mut self, name: &str, filter: impl EnvelopeFilter + 'static) -> Self {
        self.filters.insert(name.to_string(), Arc::new(filter));
        self
    }

    fn insert(
        &mut self,
        name: &str,
        durable: bool,
        payload_kind: PayloadKind,
        callback: Arc<dyn ErasedCallback>,
    ) -> Result<()> {
        if !is_valid_channel_name(name) {
            return Err(Error::Config(format!(
                "channel name {name:?} is not a valid PostgreSQL identifier"
            )));
        }
        if self.channels.contains_key(name) {
            return Err(Error::Config(format!("channel {name:?} registered twice")));
        }
        self.channels.insert(
            name.to_string(),
            ChannelDescriptor {
                name: name.to_string(),
                durable,
                payload_kind,
                callback,
            },
        );
        Ok(())
    }

    pub fn build(self) -> ChannelRegistry {
        ChannelRegistry {
            channels: self.channels,
            filters: self.filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AcceptAll;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct NoArgs {}

    fn registry_with(name: &str, durable: bool) -> ChannelRegistry {
        ChannelRegistry::builder()
            .custom::<NoArgs, _, _>(name, durable, |_args, _ctx| async { Ok(()) })
            .unwrap()
            .build()
    }

    #[test]
    fn resolves_canonical_and_dotted_names() {
        let registry = registry_with("post_reads", false);

        assert_eq!(registry.resolve("post_reads").unwrap().name(), "post_reads");
        assert_eq!(
            registry
                .resolve("myapp.channels.post_reads")
                .unwrap()
                .name(),
            "post_reads"
        );
        assert!(matches!(
            registry.resolve("missing"),
            Err(Error::UnknownChannel(_))
        ));
    }

    #[test]
    fn rejects_invalid_channel_names() {
        let result = ChannelRegistry::builder().custom::<NoArgs, _, _>(
            "bad-name; DROP TABLE",
            false,
            |_args, _ctx| async { Ok(()) },
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ChannelRegistry::builder().custom::<NoArgs, _, _>(
            "1starts_with_digit",
            false,
            |_args, _ctx| async { Ok(()) },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let result = ChannelRegistry::builder()
            .custom::<NoArgs, _, _>("dup", false, |_args, _ctx| async { Ok(()) })
            .unwrap()
            .custom::<NoArgs, _, _>("dup", true, |_args, _ctx| async { Ok(()) });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn durable_channels_filters_the_given_set() {
        let registry = ChannelRegistry::builder()
            .custom::<NoArgs, _, _>("transient_ch", false, |_args, _ctx| async { Ok(()) })
            .unwrap()
            .custom::<NoArgs, _, _>("durable_ch", true, |_args, _ctx| async { Ok(()) })
            .unwrap()
            .build();

        let names = vec!["transient_ch".to_string(), "durable_ch".to_string()];
        assert_eq!(registry.durable_channels(&names), vec!["durable_ch"]);
    }

    #[test]
    fn named_filters_are_retrievable() {
        let registry = ChannelRegistry::builder()
            .filter("accept_all", AcceptAll)
            .build();

        assert!(registry.filter("accept_all").is_some());
        assert!(registry.filter("nope").is_none());
    }
}
