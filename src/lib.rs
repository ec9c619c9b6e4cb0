//! Durable, at-most-once-per-notification message bus on PostgreSQL
//! `LISTEN`/`NOTIFY`.
//!
//! Applications register typed callbacks against named channels, then run
//! one or more workers that fan live notifications out to those callbacks.
//! Durable channels mirror every notification into a stored-notification
//! table; workers claim stored rows with `FOR UPDATE SKIP LOCKED` so that,
//! across any number of concurrent workers, each notification is executed
//! by exactly one of them. A recovery scan replays rows that were persisted
//! while no worker was running, and a supervisor restarts crashed workers
//! without losing the subscription.

pub mod channel;
pub mod cli;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod payload;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use channel::{ChannelDescriptor, ChannelRegistry, PayloadKind};
pub use config::Config;
pub use envelope::{Envelope, Source};
pub use error::{Error, Result};
pub use filter::{AcceptAll, ContextFieldEquals, EnvelopeFilter, FilterScope};
pub use payload::{CallbackContext, FixtureDecoder, RowDecoder};
pub use supervisor::{RestartPolicy, Supervisor};
pub use worker::{Worker, WorkerContext};
