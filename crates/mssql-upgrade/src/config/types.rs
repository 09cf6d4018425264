//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::script::{RepeatPolicy, DEFAULT_BATCH_SEPARATOR};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database the scripts are applied to.
    pub target: TargetConfig,

    /// How scripts are split into batches.
    #[serde(default)]
    pub script: ScriptConfig,

    /// How batches are executed.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Target database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// ADO.NET style connection string. When set, the discrete connection
    /// fields below are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection: "true", "false" or "disable" (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "[REDACTED]"),
            )
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl TargetConfig {
    /// Short description for log lines, without credentials.
    pub fn describe(&self) -> String {
        match self.connection_string {
            Some(_) => "connection string".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Script splitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Batch separator keyword (default: "GO").
    #[serde(default = "default_batch_separator")]
    pub batch_separator: String,

    /// Handling of `GO <count>` (default: expand).
    #[serde(default)]
    pub repeat_policy: RepeatPolicy,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            batch_separator: default_batch_separator(),
            repeat_policy: RepeatPolicy::default(),
        }
    }
}

/// Batch execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Run `SET XACT_ABORT ON` before the transaction starts (default: true).
    #[serde(default = "default_true")]
    pub xact_abort: bool,

    /// Per-batch timeout in seconds. 0 disables the timeout.
    #[serde(default)]
    pub statement_timeout_secs: u64,

    /// Timeout for establishing the connection in seconds (default: 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            xact_abort: true,
            statement_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ExecutionConfig {
    pub fn statement_timeout(&self) -> Option<Duration> {
        (self.statement_timeout_secs > 0).then(|| Duration::from_secs(self.statement_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_true() -> bool {
    true
}

fn default_application_name() -> String {
    "mssql-upgrade".to_string()
}

fn default_batch_separator() -> String {
    DEFAULT_BATCH_SEPARATOR.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}
