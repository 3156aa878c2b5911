use thiserror::Error;

/// Everything that can go wrong while handling an update or running an
/// admin command.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
    #[error("Failed to download a file from Telegram: {0}")]
    Download(#[from] teloxide::DownloadError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
