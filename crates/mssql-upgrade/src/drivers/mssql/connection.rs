//! SQL Server session over Tiberius.
//!
//! Batches are sent as plain SQL batches (`simple_query`), not through
//! `sp_executesql`, so statements like `CREATE PROCEDURE` and session-level
//! `SET` options behave the way they do in sqlcmd.

use std::time::Duration;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::{ExecutionConfig, TargetConfig};
use crate::error::{Result, UpgradeError};
use crate::executor::BatchSession;
use crate::migrator::Connector;

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Rolls back only if the server has not already done so (XACT_ABORT and
/// severe errors end the transaction on the server side).
const ROLLBACK_SQL: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION";

type TiberiusClient = Client<Compat<TcpStream>>;

/// Opens SQL Server sessions from the target configuration.
#[derive(Debug, Clone)]
pub struct MssqlConnector {
    target: TargetConfig,
    connect_timeout: Duration,
    xact_abort: bool,
}

impl MssqlConnector {
    pub fn new(target: TargetConfig, execution: &ExecutionConfig) -> Self {
        Self {
            target,
            connect_timeout: execution.connect_timeout(),
            xact_abort: execution.xact_abort,
        }
    }

    fn build_config(&self) -> Result<Config> {
        if let Some(ref conn) = self.target.connection_string {
            let mut config = Config::from_ado_string(conn)?;
            config.packet_size(TDS_MAX_PACKET_SIZE);
            return Ok(config);
        }

        let mut config = Config::new();
        config.host(&self.target.host);
        config.port(self.target.port);
        config.database(&self.target.database);
        config.application_name(&self.target.application_name);
        config.authentication(AuthMethod::sql_server(
            &self.target.user,
            &self.target.password,
        ));

        match self.target.encrypt.to_lowercase().as_str() {
            "disable" => config.encryption(EncryptionLevel::NotSupported),
            "false" | "no" | "0" => config.encryption(EncryptionLevel::Off),
            _ => config.encryption(EncryptionLevel::Required),
        }
        if self.target.trust_server_cert {
            config.trust_cert();
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        Ok(config)
    }

    async fn open_tcp(addr: &str) -> Result<TcpStream> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| UpgradeError::connection(e, format!("opening TCP connection to {}", addr)))?;
        tcp.set_nodelay(true).ok();

        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        Ok(tcp)
    }

    async fn open_client(&self) -> Result<TiberiusClient> {
        let config = self.build_config()?;
        let tcp = Self::open_tcp(&config.get_addr()).await?;
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| UpgradeError::connection(e, "logging in to SQL Server"))
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    type Session = MssqlSession;

    async fn connect(&self) -> Result<MssqlSession> {
        let client = tokio::time::timeout(self.connect_timeout, self.open_client())
            .await
            .map_err(|_| {
                UpgradeError::connection(
                    format!("timed out after {:?}", self.connect_timeout),
                    format!("connecting to {}", self.describe()),
                )
            })??;

        info!("Connected to SQL Server target: {}", self.describe());
        Ok(MssqlSession {
            client: Some(client),
            xact_abort: self.xact_abort,
        })
    }

    fn describe(&self) -> String {
        self.target.describe()
    }
}

/// One SQL Server connection running one upgrade transaction.
pub struct MssqlSession {
    /// `None` once the session has been aborted.
    client: Option<TiberiusClient>,
    xact_abort: bool,
}

impl MssqlSession {
    /// Send a SQL batch and drain every result set so that errors raised by
    /// later statements in the batch are reported.
    async fn run(&mut self, sql: &str) -> Result<()> {
        let client = self.client.as_mut().ok_or_else(|| {
            UpgradeError::connection("connection was aborted", "sending batch")
        })?;
        let stream = client.simple_query(sql).await?;
        stream.into_results().await?;
        Ok(())
    }
}

#[async_trait]
impl BatchSession for MssqlSession {
    async fn begin(&mut self) -> Result<()> {
        if self.xact_abort {
            self.run("SET XACT_ABORT ON").await?;
        }
        self.run("BEGIN TRANSACTION").await?;
        debug!("BEGIN TRANSACTION (xact_abort={})", self.xact_abort);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.run(sql).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.run("COMMIT TRANSACTION").await?;
        debug!("COMMIT TRANSACTION");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run(ROLLBACK_SQL).await?;
        debug!("ROLLBACK TRANSACTION");
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        // Dropping the client closes the socket. Anything sent now would
        // queue behind the unread response of the abandoned batch.
        if self.client.take().is_some() {
            warn!("Connection dropped with a batch still running");
        }
        Ok(())
    }

    async fn close(self) -> Result<()> {
        if let Some(client) = self.client {
            client.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetConfig {
        TargetConfig {
            connection_string: None,
            host: "db.example.com".to_string(),
            port: 1444,
            database: "app".to_string(),
            user: "deployer".to_string(),
            password: "secret".to_string(),
            encrypt: "true".to_string(),
            trust_server_cert: false,
            application_name: "mssql-upgrade".to_string(),
        }
    }

    #[test]
    fn test_build_config_from_fields() {
        let connector = MssqlConnector::new(target(), &ExecutionConfig::default());
        let config = connector.build_config().unwrap();
        assert_eq!(config.get_addr(), "db.example.com:1444");
    }

    #[test]
    fn test_build_config_from_connection_string() {
        let mut target = target();
        target.connection_string =
            Some("Server=tcp:other.example.com,1455;Database=x;User Id=u;Password=p".to_string());
        let connector = MssqlConnector::new(target, &ExecutionConfig::default());
        let config = connector.build_config().unwrap();
        assert_eq!(config.get_addr(), "other.example.com:1455");
        assert_eq!(connector.describe(), "connection string");
    }

    #[test]
    fn test_describe_hides_credentials() {
        let connector = MssqlConnector::new(target(), &ExecutionConfig::default());
        let described = connector.describe();
        assert_eq!(described, "db.example.com:1444/app");
        assert!(!described.contains("secret"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_connection_error() {
        let mut target = target();
        target.host = "127.0.0.1".to_string();
        target.port = 9;
        let execution = ExecutionConfig {
            connect_timeout_secs: 2,
            ..ExecutionConfig::default()
        };
        let connector = MssqlConnector::new(target, &execution);

        let err = match connector.connect().await {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert!(matches!(err, UpgradeError::Connection { .. }));
    }
}
