//! Microsoft SQL Server driver.
//!
//! - [`MssqlConnector`]: opens sessions from the target configuration
//! - [`MssqlSession`]: runs an upgrade transaction over one Tiberius client

mod connection;

pub use connection::{MssqlConnector, MssqlSession};
