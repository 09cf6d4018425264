//! Configuration validation.

use super::Config;
use crate::error::{UpgradeError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Target validation
    match config.target.connection_string {
        Some(ref conn) => {
            if conn.trim().is_empty() {
                return Err(UpgradeError::Config(
                    "target.connection_string cannot be empty".into(),
                ));
            }
        }
        None => {
            if config.target.host.is_empty() {
                return Err(UpgradeError::Config(
                    "target.host is required (or set target.connection_string)".into(),
                ));
            }
            if config.target.database.is_empty() {
                return Err(UpgradeError::Config("target.database is required".into()));
            }
            if config.target.user.is_empty() {
                return Err(UpgradeError::Config("target.user is required".into()));
            }
            if config.target.port == 0 {
                return Err(UpgradeError::Config("target.port must be non-zero".into()));
            }
        }
    }

    // Script validation
    let separator = &config.script.batch_separator;
    if separator.is_empty() || !separator.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(UpgradeError::Config(format!(
            "script.batch_separator must be a single word, got '{}'",
            separator
        )));
    }
    if separator.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(UpgradeError::Config(format!(
            "script.batch_separator cannot start with a digit, got '{}'",
            separator
        )));
    }

    // Execution validation
    if config.execution.connect_timeout_secs == 0 {
        return Err(UpgradeError::Config(
            "execution.connect_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}
