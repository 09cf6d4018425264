//! # mssql-upgrade
//!
//! Applies SQL Server upgrade scripts all-or-nothing.
//!
//! A script is split into batches on `GO` separator lines, the way `sqlcmd`
//! does it, and every batch runs inside one explicit transaction:
//!
//! - **Grammar-aware splitting**: `GO` inside strings, quoted identifiers
//!   and comments never splits a script
//! - **Repeat counts**: `GO 5` runs the preceding batch five times
//! - **Atomic apply**: the first failing batch rolls back the whole script
//! - **Cancellation and timeouts** that also roll back
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_upgrade::{Config, Migrator};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> mssql_upgrade::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let migrator = Migrator::new(config);
//!     let result = migrator.apply_file(Path::new("upgrade/001_init.sql")).await?;
//!     println!("Executed {} batches", result.batches_executed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod migrator;
pub mod script;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::{Config, ExecutionConfig, ScriptConfig, TargetConfig};
pub use drivers::{MssqlConnector, MssqlSession};
pub use error::{Result, UpgradeError};
pub use executor::{BatchSession, ExecutionSummary, TransactionalExecutor};
pub use migrator::{Connector, HealthCheckResult, MigrationResult, Migrator, ScriptPlan};
pub use script::{split_batches, Batch, ParseError, RepeatPolicy, ScriptSplitter};
