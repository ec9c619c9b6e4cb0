use serde_json::Value;

/// The slice of an envelope a filter may inspect: the channel name and the
/// payload's top-level `context` / `extras` objects.
#[derive(Debug, Clone, Copy)]
pub struct FilterScope<'a> {
    pub channel: &'a str,
    pub context: Option<&'a Value>,
    pub extras: Option<&'a Value>,
}

/// Deployment-configurable predicate over envelopes, applied identically on
/// the live and replay paths. A rejected durable envelope leaves its stored
/// row in place for another process.
pub trait EnvelopeFilter: Send + Sync {
    fn accept(&self, scope: &FilterScope<'_>) -> bool;
}

/// The default filter: accepts everything.
pub struct AcceptAll;

impl EnvelopeFilter for AcceptAll {
    fn accept(&self, _scope: &FilterScope<'_>) -> bool {
        true
    }
}

/// Accepts envelopes whose `context` (or, failing that, `extras`) object
/// carries `key == value`. Useful for tenant gating.
pub struct ContextFieldEquals {
    key: String,
    value: Value,
}

impl ContextFieldEquals {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl EnvelopeFilter for ContextFieldEquals {
    fn accept(&self, scope: &FilterScope<'_>) -> bool {
        let field = scope
            .context
            .and_then(|c| c.get(&self.key))
            .or_else(|| scope.extras.and_then(|e| e.get(&self.key)));

        field == Some(&self.value)
    }
}
