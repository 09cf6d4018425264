//! In-memory test doubles for sessions and connectors.
//!
//! `MockDatabase` keeps committed tables in shared state. Each session
//! works on a private copy between BEGIN and COMMIT, so anything a failed
//! script did is invisible once it rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UpgradeError};
use crate::executor::BatchSession;
use crate::migrator::Connector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Begin,
    Execute(String),
    Commit,
    Rollback,
    Abort,
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, usize>,
    connects: usize,
    closes: usize,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> MockSession {
        MockSession {
            db: self.clone(),
            staged: None,
            calls: Vec::new(),
            fail_begin: false,
            fail_commit: false,
            fail_rollback: false,
            cancel_on: None,
            in_flight: false,
            aborted: false,
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            db: self.clone(),
            refuse: false,
            hang: false,
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(name)
    }

    pub fn rows(&self, name: &str) -> usize {
        self.state.lock().unwrap().tables.get(name).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

fn engine_error(message: String) -> UpgradeError {
    UpgradeError::Database(tiberius::error::Error::Protocol(message.into()))
}

pub struct MockSession {
    db: MockDatabase,
    staged: Option<HashMap<String, usize>>,
    calls: Vec<SessionCall>,
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
    cancel_on: Option<(String, CancellationToken)>,
    /// A batch was dropped before it finished. Like a real client, the
    /// connection then stalls on anything but a disconnect.
    in_flight: bool,
    aborted: bool,
}

impl MockSession {
    pub fn fail_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    pub fn fail_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Cancel `token` when a batch equal to `sql` starts, then never finish it.
    /// `fail_rollback` also makes the abort that follows fail.
    pub fn cancel_on(mut self, sql: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((sql.to_string(), token));
        self
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.clone()
    }

    fn apply(&mut self, statement: &str) -> Result<()> {
        let words: Vec<&str> = statement
            .split(|c: char| c.is_whitespace() || c == '(')
            .filter(|w| !w.is_empty())
            .collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();

        // Outside a transaction only reads are allowed (health checks).
        let Some(staged) = self.staged.as_mut() else {
            return match upper.first().map(String::as_str) {
                Some("SELECT") => Ok(()),
                _ => Err(engine_error("no open transaction".into())),
            };
        };

        match upper.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["FAIL", ..] => Err(engine_error("Incorrect syntax near 'FAIL'.".into())),
            ["CREATE", "TABLE", ..] => {
                let name = words[2].to_string();
                if staged.contains_key(&name) {
                    return Err(engine_error(format!(
                        "There is already an object named '{}' in the database.",
                        name
                    )));
                }
                staged.insert(name, 0);
                Ok(())
            }
            ["DROP", "TABLE", ..] => {
                let name = words[2].trim_end_matches(';');
                staged.remove(name).map(|_| ()).ok_or_else(|| {
                    engine_error(format!(
                        "Cannot drop the table '{}', because it does not exist or you do not have permission.",
                        name
                    ))
                })
            }
            ["INSERT", "INTO", ..] => {
                let name = words[2];
                match staged.get_mut(name) {
                    Some(rows) => {
                        *rows += 1;
                        Ok(())
                    }
                    None => Err(engine_error(format!("Invalid object name '{}'.", name))),
                }
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BatchSession for MockSession {
    async fn begin(&mut self) -> Result<()> {
        self.calls.push(SessionCall::Begin);
        if self.fail_begin {
            return Err(engine_error("begin refused".into()));
        }
        self.staged = Some(self.db.state.lock().unwrap().tables.clone());
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.calls.push(SessionCall::Execute(sql.to_string()));
        if self.aborted {
            return Err(engine_error("connection closed".into()));
        }

        if let Some((trigger, token)) = &self.cancel_on {
            if sql.trim() == trigger {
                self.in_flight = true;
                token.cancel();
                std::future::pending::<()>().await;
            }
        }
        if sql.trim() == "HANG" {
            self.in_flight = true;
            std::future::pending::<()>().await;
        }

        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.apply(statement)?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.calls.push(SessionCall::Commit);
        if self.fail_commit {
            return Err(engine_error("commit refused".into()));
        }
        let staged = self
            .staged
            .take()
            .ok_or_else(|| engine_error("no open transaction".into()))?;
        self.db.state.lock().unwrap().tables = staged;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.calls.push(SessionCall::Rollback);
        if self.in_flight {
            std::future::pending::<()>().await;
        }
        self.staged = None;
        if self.fail_rollback {
            return Err(engine_error("connection reset during rollback".into()));
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.calls.push(SessionCall::Abort);
        self.staged = None;
        self.aborted = true;
        if self.fail_rollback {
            return Err(engine_error("socket shutdown failed".into()));
        }
        Ok(())
    }

    async fn close(self) -> Result<()> {
        self.db.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

pub struct MockConnector {
    db: MockDatabase,
    refuse: bool,
    hang: bool,
}

impl MockConnector {
    pub fn refuse(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Never finish connecting, like a server that drops the SYN.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.refuse {
            return Err(UpgradeError::connection("connection refused", "connecting to mock"));
        }
        self.db.state.lock().unwrap().connects += 1;
        Ok(self.db.session())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
