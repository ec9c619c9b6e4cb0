//! The `listen` command: the one operator-facing surface of the runtime.
//!
//! Applications build their [`ChannelRegistry`] at init and hand it to
//! [`main`] (or [`run`] when they parse arguments themselves):
//!
//! ```no_run
//! # use pgpubsub::channel::ChannelRegistry;
//! # #[derive(serde::Deserialize)] struct Args { model_id: i64 }
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let registry = ChannelRegistry::builder()
//!         .custom::<Args, _, _>("post_reads", false, |args, _ctx| async move {
//!             println!("post {} read", args.model_id);
//!             Ok(())
//!         })
//!         .expect("register post_reads")
//!         .build();
//!
//!     pgpubsub::cli::main(registry).await
//! }
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::db;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::filter::{AcceptAll, EnvelopeFilter};
use crate::metrics;
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "listen",
    about = "Listen for PostgreSQL notifications and dispatch them to registered callbacks"
)]
pub struct ListenArgs {
    /// Restrict the subscription set; defaults to all registered channels.
    #[arg(long, num_args = 1.., value_name = "NAME")]
    pub channels: Vec<String>,

    /// Number of workers to run under one supervisor.
    #[arg(long, default_value_t = 1, conflicts_with = "worker")]
    pub processes: usize,

    /// Run exactly one worker, no supervisor.
    #[arg(long)]
    pub worker: bool,

    /// Replay stored notifications for durable channels in the set before
    /// live processing.
    #[arg(long)]
    pub recover: bool,

    /// Do not restart workers that exit with an error.
    #[arg(long = "no-restart-on-failure")]
    pub no_restart_on_failure: bool,

    /// Log level filter, e.g. "info" or "pgpubsub=debug".
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub logformat: LogFormat,
}

/// Initialize tracing from `--loglevel` / `--logformat`, letting
/// `RUST_LOG` override the flag when set.
pub fn init_logging(args: &ListenArgs) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&args.loglevel))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match args.logformat {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Parse arguments, initialize logging, run, and map the result to an exit
/// code: zero for a clean shutdown, non-zero for an unrecoverable startup
/// error. Worker failures under an active restart policy never reach the
/// exit code.
pub async fn main(registry: ChannelRegistry) -> ExitCode {
    let args = ListenArgs::parse();
    init_logging(&args);

    match run(registry, args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("listen failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run `listen` with configuration from the environment.
pub async fn run(registry: ChannelRegistry, args: ListenArgs) -> Result<()> {
    let config = Config::from_env().map_err(|e| Error::Config(e.to_string()))?;
    run_with_config(registry, args, config).await
}

pub async fn run_with_config(
    registry: ChannelRegistry,
    args: ListenArgs,
    config: Config,
) -> Result<()> {
    if registry.is_empty() {
        return Err(Error::Config("no channels are registered".to_string()));
    }

    let channels = resolve_channels(&registry, &args.channels)?;
    let filter = resolve_filter(&registry, &config)?;

    let worker_count = if args.worker {
        1
    } else {
        args.processes.max(1)
    };

    // A recovering worker holds one streaming connection while each claim
    // runs on another; keep enough headroom that the pool cannot starve
    // itself.
    let mut database = config.database.clone();
    let floor = (2 * worker_count + 1) as u32;
    if database.max_connections < floor {
        tracing::debug!(
            "Raising pool size from {} to {} for {} worker(s)",
            database.max_connections,
            floor,
            worker_count
        );
        database.max_connections = floor;
    }

    let pool = db::init_pool(&database).await?;

    let (shutdown, _) = broadcast::channel(1);
    let registry = Arc::new(registry);
    let dispatcher = Arc::new(Dispatcher::new(filter, &config.listener));

    let ctx = WorkerContext {
        pool: pool.clone(),
        database_url: config.database.url.clone(),
        registry,
        dispatcher,
        channels: channels.clone(),
        recover: args.recover,
        poll_interval: Duration::from_secs(config.listener.poll_interval_seconds),
        shutdown: shutdown.clone(),
    };

    let metrics_task = metrics::spawn_reporter(pool, &config.metrics, channels, shutdown.clone());

    let result = if args.worker {
        let worker = ctx.worker(0);
        let handle = tokio::spawn(worker.run());
        await_with_signal(handle, &shutdown).await
    } else {
        let policy = if args.no_restart_on_failure {
            RestartPolicy::Never
        } else {
            RestartPolicy::OnFailure
        };
        let supervisor = Supervisor::new(ctx, args.processes, policy);
        let handle = tokio::spawn(supervisor.run());
        await_with_signal(handle, &shutdown).await
    };

    // Stop the metrics reporter whichever way the run ended.
    let _ = shutdown.send(());
    let _ = metrics_task.await;

    result
}

/// Validate `--channels` against the registry, reporting every unknown name
/// at once. An empty selection means all registered channels.
fn resolve_channels(registry: &ChannelRegistry, selected: &[String]) -> Result<Vec<String>> {
    if selected.is_empty() {
        return Ok(registry.channel_names());
    }

    let mut resolved: Vec<String> = Vec::new();
    let mut unknown: Vec<String> = Vec::new();
    for name in selected {
        match registry.resolve(name) {
            Ok(descriptor) => {
                let canonical = descriptor.name().to_string();
                if !resolved.contains(&canonical) {
                    resolved.push(canonical);
                }
            }
            Err(_) => unknown.push(name.clone()),
        }
    }

    if !unknown.is_empty() {
        return Err(Error::UnknownChannel(unknown.join(", ")));
    }
    Ok(resolved)
}

fn resolve_filter(
    registry: &ChannelRegistry,
    config: &Config,
) -> Result<Arc<dyn EnvelopeFilter>> {
    match &config.listener.filter {
        Some(name) => registry.filter(name).ok_or_else(|| {
            Error::Config(format!("listener filter {name:?} is not registered"))
        }),
        None => Ok(Arc::new(AcceptAll)),
    }
}

/// Await the run task, broadcasting shutdown and draining when Ctrl-C
/// arrives first.
async fn await_with_signal(
    mut handle: tokio::task::JoinHandle<Result<()>>,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    tokio::select! {
        joined = &mut handle => flatten(joined),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received; draining workers");
            let _ = shutdown.send(());
            flatten(handle.await)
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(anyhow::anyhow!(e))),
    }
}
