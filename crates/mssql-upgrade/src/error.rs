//! Error types for the upgrade library.

use std::time::Duration;

use thiserror::Error;

use crate::script::ParseError;

/// Exit code for configuration errors (invalid YAML, missing fields, etc.).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code when the database connection could not be established.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code when the script could not be split into batches.
pub const EXIT_PARSE_ERROR: u8 = 3;
/// Exit code when a batch or the commit failed and the script was rolled back.
pub const EXIT_EXECUTION_ERROR: u8 = 4;
/// Exit code when the rollback itself failed.
pub const EXIT_ROLLBACK_ERROR: u8 = 5;
/// Exit code when the run was cancelled.
pub const EXIT_CANCELLED: u8 = 6;
/// Exit code for file I/O errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for anything else.
pub const EXIT_OTHER_ERROR: u8 = 8;

/// Main error type for upgrade operations.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The script could not be tokenized or parsed. Nothing was executed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Connection could not be established, with context
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Error reported by SQL Server or the TDS client
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// A statement did not finish within the configured timeout
    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// A batch failed. The transaction was rolled back.
    #[error("Batch {batch} (starting at line {line}) failed: {source}")]
    Execution {
        /// 1-based position of the batch in the executed sequence.
        batch: usize,
        /// 1-based line where the batch starts in the script.
        line: usize,
        #[source]
        source: Box<UpgradeError>,
    },

    /// Commit failed. The transaction was rolled back.
    #[error("Commit failed: {0}")]
    Commit(#[source] Box<UpgradeError>),

    /// Rollback failed after an earlier failure; the database may be left
    /// in an indeterminate state.
    #[error("Migration failed, and rollback also failed: {original}\n  Rollback error: {rollback}")]
    Rollback {
        #[source]
        original: Box<UpgradeError>,
        rollback: Box<UpgradeError>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpgradeError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl ToString, context: impl Into<String>) -> Self {
        UpgradeError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Wrap a batch failure with its position in the script.
    pub fn execution(batch: usize, line: usize, source: UpgradeError) -> Self {
        UpgradeError::Execution {
            batch,
            line,
            source: Box::new(source),
        }
    }

    /// True if the script's effects were discarded (or never applied).
    pub fn is_rolled_back(&self) -> bool {
        matches!(
            self,
            UpgradeError::Parse(_) | UpgradeError::Execution { .. } | UpgradeError::Commit(_)
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            UpgradeError::Config(_) | UpgradeError::Yaml(_) | UpgradeError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            UpgradeError::Connection { .. } => EXIT_CONNECTION_ERROR,
            UpgradeError::Parse(_) => EXIT_PARSE_ERROR,
            UpgradeError::Execution { source, .. } if matches!(**source, UpgradeError::Cancelled) => {
                EXIT_CANCELLED
            }
            UpgradeError::Execution { .. } | UpgradeError::Commit(_) => EXIT_EXECUTION_ERROR,
            UpgradeError::Rollback { .. } => EXIT_ROLLBACK_ERROR,
            UpgradeError::Cancelled => EXIT_CANCELLED,
            UpgradeError::Io(_) => EXIT_IO_ERROR,
            UpgradeError::Database(_) | UpgradeError::Timeout(_) => EXIT_OTHER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for upgrade operations.
pub type Result<T> = std::result::Result<T, UpgradeError>;
