use crate::channel::{CallbackError, ChannelDescriptor, PayloadKind};
use crate::config::ListenerConfig;
use crate::envelope::Envelope;
use crate::filter::{EnvelopeFilter, FilterScope};
use crate::payload::CallbackContext;

/// What happened to an envelope.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The callback ran to completion. The durable path deletes the claimed
    /// row and commits.
    Completed,
    /// The deployment filter rejected the envelope. The durable path commits
    /// without deleting so another process may reclaim the row; this process
    /// will not retry the notification in this session.
    FilteredOut,
    /// The payload could not be decoded, or its `db_version` predates the
    /// configured minimum. The envelope is dropped; a durable row is left
    /// for a future deployment.
    Skipped,
    /// The callback returned an error. The durable path aborts the claim
    /// transaction so the row becomes available again.
    Failed(anyhow::Error),
}

/// Maps envelopes to callbacks: applies the deployment filter, gates on
/// `db_version`, decides what is surfaced as callback context, and
/// classifies the result. Identical on the live and replay paths.
pub struct Dispatcher {
    filter: std::sync::Arc<dyn EnvelopeFilter>,
    pass_context: bool,
    pass_extras: bool,
    min_db_version: Option<String>,
}

impl Dispatcher {
    pub fn new(filter: std::sync::Arc<dyn EnvelopeFilter>, config: &ListenerConfig) -> Self {
        Self {
            filter,
            pass_context: config.pass_context_to_listeners,
            pass_extras: config.pass_extras_to_listeners,
            min_db_version: config.min_db_version.clone(),
        }
    }

    pub async fn dispatch(
        &self,
        descriptor: &ChannelDescriptor,
        envelope: &Envelope,
    ) -> DispatchOutcome {
        let scope = FilterScope {
            channel: &envelope.channel,
            context: envelope.payload.get("context"),
            extras: envelope.payload.get("extras"),
        };
        if !self.filter.accept(&scope) {
            tracing::debug!(
                "Filter rejected {:?} notification on {}",
                envelope.source,
                envelope.channel
            );
            return DispatchOutcome::FilteredOut;
        }

        if descriptor.payload_kind() == PayloadKind::Trigger {
            if let (Some(minimum), Some(version)) = (&self.min_db_version, &envelope.db_version) {
                // Migration identifiers sort lexicographically.
                if version < minimum {
                    tracing::warn!(
                        "Skipping notification on {}: db_version {} predates minimum {}",
                        envelope.channel,
                        version,
                        minimum
                    );
                    return DispatchOutcome::Skipped;
                }
            }
        }

        let ctx = CallbackContext {
            context: self
                .pass_context
                .then(|| envelope.payload.get("context").cloned())
                .flatten(),
            extras: self
                .pass_extras
                .then(|| envelope.payload.get("extras").cloned())
                .flatten(),
        };

        match descriptor.callback().invoke(&envelope.payload, ctx).await {
            Ok(()) => DispatchOutcome::Completed,
            Err(CallbackError::Decode(e)) => {
                tracing::warn!(
                    "Dropping undecodable notification on {}: {}",
                    envelope.channel,
                    e
                );
                DispatchOutcome::Skipped
            }
            Err(CallbackError::Failed(e)) => DispatchOutcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::envelope::Source;
    use crate::filter::{AcceptAll, ContextFieldEquals};
    use crate::payload::FixtureDecoder;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Deserialize)]
    struct ReadArgs {
        model_id: i64,
    }

    #[derive(Debug, Deserialize)]
    struct Author {
        #[allow(dead_code)]
        id: i64,
        #[allow(dead_code)]
        name: String,
    }

    fn listener_config() -> ListenerConfig {
        ListenerConfig {
            poll_interval_seconds: 5,
            filter: None,
            pass_context_to_listeners: false,
            pass_extras_to_listeners: false,
            min_db_version: None,
        }
    }

    fn envelope(channel: &str, payload: Value) -> Envelope {
        let db_version = payload
            .get("db_version")
            .and_then(Value::as_str)
            .map(str::to_string);
        Envelope {
            channel: channel.to_string(),
            payload,
            source: Source::Live,
            db_version,
        }
    }

    #[tokio::test]
    async fn completed_when_callback_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = ChannelRegistry::builder()
            .custom::<ReadArgs, _, _>("post_reads", false, move |args, _ctx| {
                let counter = counter.clone();
                async move {
                    assert_eq!(args.model_id, 12);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
            .build();

        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &listener_config());
        let descriptor = registry.resolve("post_reads").unwrap();
        let outcome = dispatcher
            .dispatch(
                descriptor,
                &envelope("post_reads", json!({"kwargs": {"model_id": 12}})),
            )
            .await;

        assert!(matches!(outcome, DispatchOutcome::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_rejection_drops_without_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = ChannelRegistry::builder()
            .custom::<ReadArgs, _, _>("post_reads", true, move |_args, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
            .build();

        let dispatcher = Dispatcher::new(
            Arc::new(ContextFieldEquals::new("tenant", "t1")),
            &listener_config(),
        );
        let descriptor = registry.resolve("post_reads").unwrap();
        let outcome = dispatcher
            .dispatch(
                descriptor,
                &envelope(
                    "post_reads",
                    json!({"kwargs": {"model_id": 1}, "context": {"tenant": "t2"}}),
                ),
            )
            .await;

        assert!(matches!(outcome, DispatchOutcome::FilteredOut));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decode_failure_is_skipped() {
        let registry = ChannelRegistry::builder()
            .custom::<ReadArgs, _, _>("post_reads", false, |_args, _ctx| async { Ok(()) })
            .unwrap()
            .build();

        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &listener_config());
        let descriptor = registry.resolve("post_reads").unwrap();
        let outcome = dispatcher
            .dispatch(
                descriptor,
                &envelope("post_reads", json!({"kwargs": {"model_id": "not a number"}})),
            )
            .await;

        assert!(matches!(outcome, DispatchOutcome::Skipped));
    }

    #[tokio::test]
    async fn callback_errors_are_propagated() {
        let registry = ChannelRegistry::builder()
            .custom::<ReadArgs, _, _>("post_reads", true, |_args, _ctx| async {
                Err(anyhow::anyhow!("boom"))
            })
            .unwrap()
            .build();

        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &listener_config());
        let descriptor = registry.resolve("post_reads").unwrap();
        let outcome = dispatcher
            .dispatch(
                descriptor,
                &envelope("post_reads", json!({"kwargs": {"model_id": 5}})),
            )
            .await;

        match outcome {
            DispatchOutcome::Failed(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn old_db_version_is_skipped_for_trigger_channels() {
        let registry = ChannelRegistry::builder()
            .trigger(
                "author_trigger",
                true,
                FixtureDecoder::<Author>::new(),
                |_old, _new, _ctx| async { Ok(()) },
            )
            .unwrap()
            .build();

        let mut config = listener_config();
        config.min_db_version = Some("0005_backfill".to_string());
        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &config);
        let descriptor = registry.resolve("author_trigger").unwrap();

        let outcome = dispatcher
            .dispatch(
                descriptor,
                &envelope(
                    "author_trigger",
                    json!({
                        "app": "blog", "model": "Author", "old": null,
                        "new": {"model": "blog.author", "pk": 1, "fields": {"name": "P"}},
                        "db_version": "0004_earlier"
                    }),
                ),
            )
            .await;

        assert!(matches!(outcome, DispatchOutcome::Skipped));
    }

    #[tokio::test]
    async fn context_is_surfaced_only_when_enabled() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let registry = ChannelRegistry::builder()
            .custom::<ReadArgs, _, _>("post_reads", false, move |_args, ctx| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = ctx.context;
                    Ok(())
                }
            })
            .unwrap()
            .build();
        let descriptor = registry.resolve("post_reads").unwrap();
        let payload = json!({"kwargs": {"model_id": 1}, "context": {"tenant": "t1"}});

        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &listener_config());
        dispatcher
            .dispatch(descriptor, &envelope("post_reads", payload.clone()))
            .await;
        assert!(seen.lock().unwrap().is_none());

        let mut config = listener_config();
        config.pass_context_to_listeners = true;
        let dispatcher = Dispatcher::new(Arc::new(AcceptAll), &config);
        dispatcher
            .dispatch(descriptor, &envelope("post_reads", payload))
            .await;
        assert_eq!(*seen.lock().unwrap(), Some(json!({"tenant": "t1"})));
    }
}
