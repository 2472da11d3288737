//! Storage-layer errors for the per-container databases.

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {message}")]
    SqliteError { message: String },

    #[error("Migration failed at version {version}: {message}")]
    MigrationFailed { version: u32, message: String },

    #[error("Database locked (another cleave in progress): {path}")]
    DbLocked { path: String },

    #[error("Invalid record: {message}")]
    InvalidRecord { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
