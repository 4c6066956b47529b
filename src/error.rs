use std::time::Duration;
use thiserror::Error;

/// Main error type for tabsync
#[derive(Error, Debug)]
pub enum TabsyncError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Watch directory could not be observed
    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    /// File content rejected by the parser
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Store write failed
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Ledger state did not allow the operation
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The Parsing+Syncing span for a file exceeded its budget
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Work was abandoned because the pipeline is stopping
    #[error("Pipeline shutting down")]
    Shutdown,

    /// A subscriber could not take delivery of a notification
    #[error("Notification error: {0}")]
    Notification(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl TabsyncError {
    /// Stable identifier carried in `failed` notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            TabsyncError::Database(_) => "Database",
            TabsyncError::Io(_) => "Io",
            TabsyncError::Config(_) => "Config",
            TabsyncError::Detection(_) => "Detection",
            TabsyncError::Parse(e) => e.kind(),
            TabsyncError::Sync(e) => e.kind(),
            TabsyncError::Ledger(_) => "Ledger",
            TabsyncError::Timeout(_) => "Timeout",
            TabsyncError::Shutdown => "Shutdown",
            TabsyncError::Notification(_) => "Notification",
            TabsyncError::InvalidInput(_) => "InvalidInput",
        }
    }
}

/// Filesystem observation failures. Logged and retried with backoff by the detector.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("cannot access {path}: {reason}")]
    Access { path: String, reason: String },

    #[error("watcher failed: {0}")]
    Watch(String),
}

/// Non-retryable content errors. The file moves to `Failed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("file is {size} bytes, limit is {limit}")]
    Oversized { size: u64, limit: u64 },

    #[error("missing required columns: {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("no data rows")]
    Empty,

    #[error("row {row}, column '{column}': {reason}")]
    MalformedRow {
        row: usize,
        column: String,
        reason: String,
    },

    #[error("cannot read file: {reason}")]
    Unreadable { reason: String },
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Oversized { .. } => "ErrOversized",
            ParseError::SchemaMismatch { .. } => "ErrSchemaMismatch",
            ParseError::Empty => "ErrEmpty",
            ParseError::MalformedRow { .. } => "ErrMalformedRow",
            ParseError::Unreadable { .. } => "Io",
        }
    }
}

/// Store write failures, split by whether a retry can change the outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store rejected batch: {0}")]
    Fatal(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transient(_) => "SyncTransient",
            SyncError::Fatal(_) => "SyncFatal",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Commit or release by a claimant that no longer holds the claim
    #[error("hash {hash} is not claimed by this attempt")]
    NotClaimed { hash: String },

    #[error("unknown ledger status '{0}'")]
    UnknownStatus(String),
}

/// Convenient Result type using TabsyncError
pub type Result<T> = std::result::Result<T, TabsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TabsyncError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: TabsyncError = rusqlite_err.into();
        assert!(matches!(err, TabsyncError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TabsyncError = io_err.into();
        assert!(matches!(err, TabsyncError::Io(_)));
    }

    #[test]
    fn test_parse_error_kinds() {
        let err: TabsyncError = ParseError::MalformedRow {
            row: 2,
            column: "ts".into(),
            reason: "bad".into(),
        }
        .into();
        assert_eq!(err.kind(), "ErrMalformedRow");
        assert!(err.to_string().contains("row 2"));
        assert_eq!(TabsyncError::from(ParseError::Empty).kind(), "ErrEmpty");
    }

    #[test]
    fn test_sync_error_transient() {
        assert!(SyncError::Transient("timeout".into()).is_transient());
        assert!(!SyncError::Fatal("auth".into()).is_transient());
        assert_eq!(TabsyncError::from(SyncError::Fatal("x".into())).kind(), "SyncFatal");
    }
}
