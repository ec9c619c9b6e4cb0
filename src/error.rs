use crate::payload::PayloadError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Listener connection lost: {0}")]
    SessionLost(String),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
