//! Error types for the PostgreSQL connection factory.

use sqlx_core::error::Error as SqlxError;

/// Errors raised while building the pool or using a session.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection error (unreachable server, pool timeout, query failure).
    #[error("Database connection error: {0}")]
    Connection(#[from] SqlxError),

    /// Configuration error (malformed URL, invalid pool settings).
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error came from talking to the database rather than from configuration.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
