//! Database driver implementations.
//!
//! Each driver provides a [`Connector`](crate::migrator::Connector) and a
//! [`BatchSession`](crate::executor::BatchSession) for one database engine.
//! SQL Server is the only engine whose batch-separator convention the
//! splitter understands, so it is the only driver.

pub mod mssql;

pub use mssql::{MssqlConnector, MssqlSession};
