//! All-or-nothing execution of split batches.
//!
//! - [`BatchSession`]: one open connection that can run a transaction
//! - [`TransactionalExecutor`]: runs every batch of a script inside a single
//!   transaction on one session, committing only if all of them succeed
//!
//! The executor never retries. The first failing batch rolls back the whole
//! transaction and its error is returned; if the rollback fails too, both
//! errors are returned together as [`UpgradeError::Rollback`].
//!
//! A batch that times out or is cancelled is still running on the server, so
//! no ROLLBACK can be sent after it on the same connection. The session is
//! aborted instead and the server rolls the transaction back when the
//! connection goes away.
//!
//! Progress is published on a [`watch`] channel; see
//! [`TransactionalExecutor::subscribe`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, UpgradeError};
use crate::script::Batch;

/// A live database session able to run one explicit transaction.
///
/// Methods are called strictly one after another; the executor never has
/// two calls in flight on the same session.
#[async_trait]
pub trait BatchSession: Send {
    /// Start the transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Run one batch inside the transaction, consuming all of its results.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Commit the transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Drop the connection without talking to the server.
    ///
    /// Called when a batch was abandoned mid-flight. Only [`close`] may
    /// follow.
    ///
    /// [`close`]: BatchSession::close
    async fn abort(&mut self) -> Result<()>;

    /// Release the session.
    async fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Where the executor is in the lifecycle of one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    /// No session yet.
    Idle,
    /// Session open, no transaction.
    Connected,
    InTransaction,
    /// Running the batch at this 1-based position.
    Executing(usize),
    RollingBack,
    Committed,
    RolledBack,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Idle => write!(f, "idle"),
            ExecutorState::Connected => write!(f, "connected"),
            ExecutorState::InTransaction => write!(f, "in transaction"),
            ExecutorState::Executing(n) => write!(f, "executing batch {}", n),
            ExecutorState::RollingBack => write!(f, "rolling back"),
            ExecutorState::Committed => write!(f, "committed"),
            ExecutorState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Counters for a committed script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Batches produced by the splitter, blank ones included.
    pub batches_total: usize,
    /// Batches sent to the server.
    pub batches_executed: usize,
    /// Blank batches that were skipped.
    pub batches_skipped: usize,
    /// Time from BEGIN to COMMIT.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// Runs the batches of one script in a single transaction.
#[derive(Debug, Clone)]
pub struct TransactionalExecutor {
    statement_timeout: Option<Duration>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ExecutorState>>,
}

impl Default for TransactionalExecutor {
    fn default() -> Self {
        Self {
            statement_timeout: None,
            cancel: CancellationToken::new(),
            state: Arc::new(watch::Sender::new(ExecutorState::Idle)),
        }
    }
}

impl TransactionalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the executor move through its states. Starts at
    /// [`ExecutorState::Idle`] and ends at `Committed`, `RolledBack`, or
    /// `RollingBack` when the rollback itself failed.
    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    fn enter(&self, state: ExecutorState) {
        debug!("Executor {}", state);
        self.state.send_replace(state);
    }

    /// Fail any batch that runs longer than `timeout`.
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Cancelling `token` fails the running batch and rolls back.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Execute `batches` in order on `session` inside one transaction.
    ///
    /// Blank batches are skipped. On the first failure the transaction is
    /// rolled back and the failure is returned as
    /// [`UpgradeError::Execution`] (or [`UpgradeError::Commit`] if COMMIT
    /// itself failed). The session is left open either way; closing it is
    /// the caller's job.
    pub async fn execute<S: BatchSession>(
        &self,
        batches: &[Batch<'_>],
        session: &mut S,
    ) -> Result<ExecutionSummary> {
        let started = Instant::now();
        self.enter(ExecutorState::Connected);
        debug!("{} batches to run", batches.len());

        if self.cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        session.begin().await?;
        self.enter(ExecutorState::InTransaction);

        let mut executed = 0;
        let mut skipped = 0;

        for (i, batch) in batches.iter().enumerate() {
            let position = i + 1;

            if batch.is_blank() {
                debug!("Skipping blank batch {} (line {})", position, batch.line);
                skipped += 1;
                continue;
            }

            self.enter(ExecutorState::Executing(position));
            debug!(
                "Batch {}/{} (line {}, {} bytes)",
                position,
                batches.len(),
                batch.line,
                batch.text.len()
            );

            if let Err(e) = self.run_batch(session, batch.text).await {
                error!(
                    "Batch {} starting at line {} failed: {}",
                    position, batch.line, e
                );
                let abandoned = matches!(e, UpgradeError::Timeout(_) | UpgradeError::Cancelled);
                let failure = UpgradeError::execution(position, batch.line, e);
                if abandoned {
                    return Err(self.abort(session, failure).await);
                }
                return Err(self.roll_back(session, failure).await);
            }
            executed += 1;
        }

        if let Err(e) = session.commit().await {
            error!("Commit failed: {}", e);
            return Err(self
                .roll_back(session, UpgradeError::Commit(Box::new(e)))
                .await);
        }
        self.enter(ExecutorState::Committed);

        let summary = ExecutionSummary {
            batches_total: batches.len(),
            batches_executed: executed,
            batches_skipped: skipped,
            duration: started.elapsed(),
        };
        info!(
            "Transaction committed: {} batches executed, {} blank skipped in {:.2}s",
            summary.batches_executed,
            summary.batches_skipped,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }

    /// Run one batch, racing it against cancellation and the timeout.
    async fn run_batch<S: BatchSession>(&self, session: &mut S, sql: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        let run = async {
            match self.statement_timeout {
                Some(limit) => match tokio::time::timeout(limit, session.execute(sql)).await {
                    Ok(result) => result,
                    Err(_) => Err(UpgradeError::Timeout(limit)),
                },
                None => session.execute(sql).await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UpgradeError::Cancelled),
            result = run => result,
        }
    }

    /// Roll back once and fold any rollback failure into the returned error.
    async fn roll_back<S: BatchSession>(&self, session: &mut S, failure: UpgradeError) -> UpgradeError {
        self.enter(ExecutorState::RollingBack);
        match session.rollback().await {
            Ok(()) => {
                self.enter(ExecutorState::RolledBack);
                warn!("Transaction rolled back: no changes from this script were kept");
                failure
            }
            Err(rollback) => {
                error!(
                    "Rollback failed, database state is unknown: {}",
                    rollback
                );
                UpgradeError::Rollback {
                    original: Box::new(failure),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    /// Drop the connection under an abandoned batch. The server rolls back
    /// the open transaction when the session ends.
    async fn abort<S: BatchSession>(&self, session: &mut S, failure: UpgradeError) -> UpgradeError {
        self.enter(ExecutorState::RollingBack);
        match session.abort().await {
            Ok(()) => {
                self.enter(ExecutorState::RolledBack);
                warn!("Connection dropped: the server rolls back the open transaction");
                failure
            }
            Err(abort) => {
                error!("Dropping the connection failed, database state is unknown: {}", abort);
                UpgradeError::Rollback {
                    original: Box::new(failure),
                    rollback: Box::new(abort),
                }
            }
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
