//! Per-script workflow: split, connect, execute, close.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::drivers::MssqlConnector;
use crate::error::{Result, UpgradeError};
use crate::executor::{BatchSession, ExecutionSummary, TransactionalExecutor};
use crate::script::{Batch, ScriptSplitter};

/// Opens sessions against the target database.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: BatchSession;

    /// Open a new session. Each script gets its own.
    async fn connect(&self) -> Result<Self::Session>;

    /// Target description for log lines, without credentials.
    fn describe(&self) -> String;
}

/// Applies upgrade scripts, one transaction per script.
pub struct Migrator<C = MssqlConnector> {
    config: Config,
    connector: C,
    cancel: CancellationToken,
}

/// Result of applying one script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Script name (usually its path).
    pub script: String,

    /// Final status.
    pub status: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds, connection time included.
    pub duration_seconds: f64,

    /// Batches produced by the splitter.
    pub batches_total: usize,

    /// Batches sent to the server.
    pub batches_executed: usize,

    /// Blank batches skipped.
    pub batches_skipped: usize,
}

impl MigrationResult {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Batches a script would run, without touching the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptPlan {
    pub script: String,
    pub batches: Vec<PlannedBatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedBatch {
    /// 1-based position in execution order.
    pub position: usize,
    /// 0-based index of the source batch (shared by repeats).
    pub index: usize,
    /// 1-based starting line.
    pub line: usize,
    /// Blank batches are skipped at execution time.
    pub blank: bool,
    pub text: String,
}

impl ScriptPlan {
    /// Split `script` with `splitter` and describe the result.
    pub fn build(splitter: &ScriptSplitter, name: &str, script: &str) -> Result<Self> {
        let batches = splitter.split(script)?;
        Ok(Self {
            script: name.to_string(),
            batches: batches
                .iter()
                .enumerate()
                .map(|(i, b)| PlannedBatch {
                    position: i + 1,
                    index: b.index,
                    line: b.line,
                    blank: b.is_blank(),
                    text: b.text.to_string(),
                })
                .collect(),
        })
    }

    /// Number of batches that would be sent to the server.
    pub fn executable(&self) -> usize {
        self.batches.iter().filter(|b| !b.blank).count()
    }
}

/// Result of a connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub target: String,
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl Migrator<MssqlConnector> {
    /// Create a migrator for the SQL Server target in `config`.
    pub fn new(config: Config) -> Self {
        let connector = MssqlConnector::new(config.target.clone(), &config.execution);
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> Migrator<C> {
    /// Create a migrator that opens sessions through `connector`.
    pub fn with_connector(config: Config, connector: C) -> Self {
        Self {
            config,
            connector,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops the running script and rolls it back.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Split a script with the configured separator and repeat policy.
    pub fn split<'a>(&self, script: &'a str) -> Result<Vec<Batch<'a>>> {
        Ok(self.config.script.splitter().split(script)?)
    }

    /// Dry run: show the batches `script` would be split into.
    pub fn plan(&self, name: &str, script: &str) -> Result<ScriptPlan> {
        ScriptPlan::build(&self.config.script.splitter(), name, script)
    }

    /// Apply one script as a single transaction.
    ///
    /// The script is split before any connection is opened, so a parse
    /// error never reaches the database. Once opened, the session is closed
    /// on every path.
    pub async fn apply_script(&self, name: &str, script: &str) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let batches = self.split(script).map_err(|e| {
            error!("{}: {}", name, e);
            e
        })?;

        if self.cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        info!(
            "Applying {} ({} batches) to {} [run {}]",
            name,
            batches.len(),
            self.connector.describe(),
            run_id
        );

        let mut session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("{}: cancelled while connecting", name);
                return Err(UpgradeError::Cancelled);
            }
            connected = self.connector.connect() => connected?,
        };
        let outcome = self.executor().execute(&batches, &mut session).await;
        if let Err(e) = session.close().await {
            warn!("Failed to close session after {}: {}", name, e);
        }
        let summary = outcome?;

        Ok(self.result(run_id, name, started_at, timer, summary))
    }

    /// Read a UTF-8 script file and apply it.
    pub async fn apply_file(&self, path: &Path) -> Result<MigrationResult> {
        let script = read_script(path)?;
        self.apply_script(&path.display().to_string(), &script).await
    }

    /// Open a session, run `SELECT 1` and close it.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let target = self.connector.describe();

        let outcome = match self.connector.connect().await {
            Ok(mut session) => {
                let ping = session.execute("SELECT 1").await;
                if let Err(e) = session.close().await {
                    warn!("Failed to close health-check session: {}", e);
                }
                ping
            }
            Err(e) => Err(e),
        };

        Ok(HealthCheckResult {
            target,
            connected: outcome.is_ok(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: outcome.err().map(|e| e.to_string()),
        })
    }

    fn executor(&self) -> TransactionalExecutor {
        TransactionalExecutor::new()
            .with_statement_timeout(self.config.execution.statement_timeout())
            .with_cancel(self.cancel.clone())
    }

    fn result(
        &self,
        run_id: String,
        name: &str,
        started_at: DateTime<Utc>,
        timer: Instant,
        summary: ExecutionSummary,
    ) -> MigrationResult {
        MigrationResult {
            run_id,
            script: name.to_string(),
            status: "committed".to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_seconds: timer.elapsed().as_secs_f64(),
            batches_total: summary.batches_total,
            batches_executed: summary.batches_executed,
            batches_skipped: summary.batches_skipped,
        }
    }
}

/// Read a script file, dropping a leading UTF-8 byte order mark.
pub fn read_script(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    Ok(match content.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDatabase;
    use std::io::Write;

    fn config() -> Config {
        Config::from_yaml("target:\n  host: localhost\n  database: app\n  user: sa\n").unwrap()
    }

    #[tokio::test]
    async fn test_apply_commits_and_closes() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let result = migrator
            .apply_script(
                "001_create.sql",
                "CREATE TABLE T(id int);\nGO\nINSERT INTO T VALUES(1);",
            )
            .await
            .unwrap();

        assert_eq!(result.status, "committed");
        assert_eq!(result.script, "001_create.sql");
        assert_eq!(result.batches_executed, 2);
        assert!(db.has_table("T"));
        assert_eq!(db.rows("T"), 1);
        assert_eq!(db.connects(), 1);
        assert_eq!(db.closes(), 1);
    }

    #[tokio::test]
    async fn test_go_in_literal_does_not_split() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let result = migrator
            .apply_script("print.sql", "PRINT 'GO';\nGO\nSELECT 1;")
            .await
            .unwrap();

        assert_eq!(result.batches_total, 2);
        assert_eq!(result.batches_executed, 2);
    }

    #[tokio::test]
    async fn test_parse_error_never_connects() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let err = migrator.apply_script("bad.sql", "SELECT '").await.unwrap_err();

        match err {
            UpgradeError::Parse(ref parse) => assert_eq!(parse.line, 1),
            ref other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.connects(), 0);
        assert_eq!(db.closes(), 0);
    }

    #[tokio::test]
    async fn test_failed_script_rolls_back_and_closes() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let err = migrator
            .apply_script(
                "002_drop.sql",
                "CREATE TABLE T(id int);\nGO\nDROP TABLE NoSuchTable;",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::Execution { batch: 2, .. }));
        assert!(err.is_rolled_back());
        assert!(!db.has_table("T"));
        assert_eq!(db.closes(), 1);
    }

    #[tokio::test]
    async fn test_blank_batches_between_separators() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let result = migrator
            .apply_script("blank.sql", "GO\nGO\nGO\nSELECT 1;")
            .await
            .unwrap();

        assert_eq!(result.batches_total, 4);
        assert_eq!(result.batches_executed, 1);
        assert_eq!(result.batches_skipped, 3);
    }

    #[tokio::test]
    async fn test_later_script_sees_committed_objects() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        migrator
            .apply_script("001.sql", "CREATE TABLE T(id int)")
            .await
            .unwrap();
        migrator
            .apply_script("002.sql", "INSERT INTO T VALUES(1)\nGO 2")
            .await
            .unwrap();

        assert_eq!(db.rows("T"), 2);
        assert_eq!(db.connects(), 2);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector().refuse());

        let err = migrator.apply_script("x.sql", "SELECT 1").await.unwrap_err();

        assert!(matches!(err, UpgradeError::Connection { .. }));
        assert_eq!(db.closes(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_connecting() {
        let db = MockDatabase::new();
        let token = CancellationToken::new();
        token.cancel();
        let migrator = Migrator::with_connector(config(), db.connector()).with_cancel(token);

        let err = migrator.apply_script("x.sql", "SELECT 1").await.unwrap_err();

        assert!(matches!(err, UpgradeError::Cancelled));
        assert_eq!(db.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_a_hanging_connect() {
        let db = MockDatabase::new();
        let token = CancellationToken::new();
        let migrator =
            Migrator::with_connector(config(), db.connector().hang()).with_cancel(token.clone());

        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(migrator.apply_script("x.sql", "SELECT 1"), cancel);

        assert!(matches!(result, Err(UpgradeError::Cancelled)));
        assert_eq!(db.connects(), 0);
        assert_eq!(db.closes(), 0);
    }

    #[tokio::test]
    async fn test_apply_file_strips_bom() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "\u{feff}CREATE TABLE T(id int)\nGO\n").unwrap();

        let result = migrator.apply_file(file.path()).await.unwrap();

        assert_eq!(result.batches_executed, 1);
        assert!(db.has_table("T"));
    }

    #[tokio::test]
    async fn test_apply_missing_file_is_io_error() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let err = migrator
            .apply_file(Path::new("does/not/exist.sql"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::Io(_)));
    }

    #[test]
    fn test_plan_lists_batches() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());

        let plan = migrator
            .plan("seed.sql", "GO\nINSERT INTO T VALUES(1)\nGO 2\nSELECT 1")
            .unwrap();

        assert_eq!(plan.batches.len(), 4);
        assert_eq!(plan.executable(), 3);
        assert!(plan.batches[0].blank);
        assert_eq!(plan.batches[1].index, plan.batches[2].index);
        assert_eq!(plan.batches[3].position, 4);
        assert_eq!(plan.batches[3].line, 4);
        assert_eq!(db.connects(), 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = MockDatabase::new();
        let migrator = Migrator::with_connector(config(), db.connector());
        let result = migrator.health_check().await.unwrap();
        assert!(result.connected);
        assert!(result.error.is_none());
        assert_eq!(db.closes(), 1);

        let migrator = Migrator::with_connector(config(), db.connector().refuse());
        let result = migrator.health_check().await.unwrap();
        assert!(!result.connected);
        assert!(result.error.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_result_json() {
        let result = MigrationResult {
            run_id: "run-1".to_string(),
            script: "001.sql".to_string(),
            status: "committed".to_string(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_seconds: 0.5,
            batches_total: 2,
            batches_executed: 2,
            batches_skipped: 0,
        };
        let json = result.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "committed");
        assert_eq!(value["batches_executed"], 2);
    }
}
