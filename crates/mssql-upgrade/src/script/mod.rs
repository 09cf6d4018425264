//! Upgrade script handling: T-SQL lexing and batch splitting.
//!
//! A script is split into batches on separator lines (`GO` by default),
//! the same convention `sqlcmd` and SSMS use. Separators are recognized on
//! the token stream, never by searching the raw text, so `GO` inside a
//! string literal, identifier or comment does not split the script.
//!
//! ```
//! use mssql_upgrade::script::split_batches;
//!
//! let batches = split_batches("PRINT 'GO';\nGO\nSELECT 1;").unwrap();
//! let texts: Vec<&str> = batches.iter().map(|b| b.text).collect();
//! assert_eq!(texts, ["PRINT 'GO';", "SELECT 1;"]);
//! ```

mod lexer;
mod splitter;

pub use lexer::{Lexer, Token, TokenKind};
pub use splitter::{split_batches, ScriptSplitter, DEFAULT_BATCH_SEPARATOR, MAX_REPEAT_COUNT};

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A script that could not be tokenized or parsed.
///
/// Line and column are 1-based; the column counts characters.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// One independently executable slice of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'a> {
    /// Exact, unmodified text of the batch.
    pub text: &'a str,
    /// 0-based position among the batches written in the script. Repeated
    /// batches share the index of their source.
    pub index: usize,
    /// Byte range of `text` within the script.
    pub span: Range<usize>,
    /// 1-based line where the batch starts.
    pub line: usize,
}

impl Batch<'_> {
    /// True if the batch has nothing but whitespace to send.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// What to do with the count in `GO <count>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    /// Emit the preceding batch `count` times in a row.
    #[default]
    Expand,
    /// Validate the count but emit the batch once.
    Ignore,
}
