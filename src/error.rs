//! Error types for projectroles-sync

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote site not found: {0}")]
    SiteNotFound(Uuid),

    #[error("Site {site} has mode {mode}, expected {expected}")]
    InvalidSiteMode {
        site: Uuid,
        mode: String,
        expected: String,
    },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Default owner account \"{0}\" not found")]
    DefaultOwnerMissing(String),

    #[error(
        "Local category \"{title}\" ({local_uuid}) conflicts with remote category {remote_uuid}"
    )]
    CategoryConflict {
        title: String,
        local_uuid: Uuid,
        remote_uuid: Uuid,
    },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Illegal access level transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
