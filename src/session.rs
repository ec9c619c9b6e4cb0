use std::collections::HashSet;
use std::time::Duration;

use sqlx::postgres::PgListener;

use crate::db::redact_db_url;
use crate::error::{Error, Result};

/// A live notification as received from the server.
#[derive(Debug, Clone)]
pub struct LiveNotification {
    pub channel: String,
    pub payload: String,
    /// Backend pid of the notifying connection.
    pub process_id: u32,
}

/// Result of one bounded poll.
#[derive(Debug)]
pub enum Polled {
    Notification(LiveNotification),
    Timeout,
}

/// One dedicated listening connection.
///
/// The connection is never enrolled in a user transaction and a poll that
/// times out costs no server-side work. Duplicate notifications are only
/// coalesced when the server itself coalesces them; no in-process dedup
/// happens here.
pub struct ListenSession {
    listener: PgListener,
    subscribed: HashSet<String>,
}

impl ListenSession {
    /// Open a dedicated connection for listening.
    pub async fn connect(database_url: &str) -> Result<Self> {
        tracing::debug!(
            "Opening listen connection to {}",
            redact_db_url(database_url)
        );
        let listener = PgListener::connect(database_url).await?;
        Ok(Self {
            listener,
            subscribed: HashSet::new(),
        })
    }

    /// Issue `LISTEN` for each channel. Idempotent per session; channel
    /// names were validated as plain identifiers at registration and are
    /// quoted by the driver.
    pub async fn subscribe(&mut self, channels: &[&str]) -> Result<()> {
        for channel in channels {
            if self.subscribed.contains(*channel) {
                continue;
            }
            self.listener.listen(channel).await?;
            self.subscribed.insert((*channel).to_string());
        }
        tracing::info!("Listening on channels: {:?}", self.subscribed);
        Ok(())
    }

    /// Block up to `deadline` for a server notification.
    ///
    /// The driver reconnects transparently when the connection drops and
    /// signals the gap by yielding an empty slot; notifications may have
    /// been lost across that gap, so the session reports it as fatal and
    /// lets the supervisor restart the worker.
    pub async fn poll(&mut self, deadline: Duration) -> Result<Polled> {
        match tokio::time::timeout(deadline, self.listener.try_recv()).await {
            Err(_elapsed) => Ok(Polled::Timeout),
            Ok(Ok(Some(notification))) => Ok(Polled::Notification(LiveNotification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
                process_id: notification.process_id(),
            })),
            Ok(Ok(None)) => Err(Error::SessionLost(
                "listener connection was reset; notifications may have been missed".to_string(),
            )),
            Ok(Err(e)) => Err(Error::Database(e)),
        }
    }

    /// Release the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.listener.unlisten_all().await {
            tracing::debug!("UNLISTEN on close failed: {}", e);
        }
    }
}
