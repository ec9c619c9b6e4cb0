//! Shared helpers for the live-database suite.
//!
//! Every test self-skips unless `TEST_DATABASE_URL` points at a reachable
//! PostgreSQL instance. Tests isolate themselves by using unique channel
//! names, so the suite can run in parallel against one database.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use sqlx::PgPool;

use pgpubsub::config::ListenerConfig;

pub fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Connect and migrate, or `None` when no test database is configured.
pub async fn pool() -> Option<PgPool> {
    let url = match database_url() {
        Some(url) => url,
        None => {
            eprintln!("skipping: TEST_DATABASE_URL is not set");
            return None;
        }
    };

    let pool = PgPool::connect(&url).await.expect("connect test database");
    pgpubsub::db::run_migrations(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

/// A unique, valid channel name per test run.
pub fn unique_channel(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn listener_config() -> ListenerConfig {
    ListenerConfig {
        poll_interval_seconds: 1,
        filter: None,
        pass_context_to_listeners: false,
        pass_extras_to_listeners: false,
        min_db_version: None,
    }
}

/// Publish a durable notification exactly the way producers do: insert the
/// stored row and emit the NOTIFY in one transaction.
pub async fn publish_durable(
    pool: &PgPool,
    channel: &str,
    payload: &Value,
    db_version: Option<&str>,
) {
    let mut tx = pool.begin().await.expect("begin publish tx");
    sqlx::query(
        "INSERT INTO pgpubsub_notifications (channel, payload, db_version) VALUES ($1, $2, $3)",
    )
    .bind(channel)
    .bind(payload)
    .bind(db_version)
    .execute(&mut *tx)
    .await
    .expect("insert stored notification");
    sqlx::query("SELECT pg_notify($1, $2::text)")
        .bind(channel)
        .bind(payload.to_string())
        .execute(&mut *tx)
        .await
        .expect("notify");
    tx.commit().await.expect("commit publish tx");
}

/// Emit a NOTIFY without a stored row.
pub async fn publish_transient(pool: &PgPool, channel: &str, payload: &Value) {
    sqlx::query("SELECT pg_notify($1, $2::text)")
        .bind(channel)
        .bind(payload.to_string())
        .execute(pool)
        .await
        .expect("notify");
}

pub async fn count_rows(pool: &PgPool, channel: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM pgpubsub_notifications WHERE channel = $1")
        .bind(channel)
        .fetch_one(pool)
        .await
        .expect("count stored rows")
}

/// Wait for a backend whose last statement was `LISTEN` on this channel,
/// so tests do not NOTIFY before the worker has subscribed. Returns the
/// matching backend pids.
pub async fn wait_for_listeners(pool: &PgPool, channel: &str, expected: usize) -> Vec<i32> {
    let pattern = format!("%LISTEN%{}%", channel);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let pids: Vec<i32> = sqlx::query_scalar(
            "SELECT pid FROM pg_stat_activity \
             WHERE query ILIKE $1 AND pid <> pg_backend_pid() AND state = 'idle'",
        )
        .bind(&pattern)
        .fetch_all(pool)
        .await
        .expect("query pg_stat_activity");

        if pids.len() >= expected {
            return pids;
        }
        assert!(
            Instant::now() < deadline,
            "no LISTEN backend appeared for {channel}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Callback instrumentation: invocation counter plus captured payload args.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, value: Value) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(value);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}
