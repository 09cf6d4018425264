//! Batch splitting on top of the token stream.

use std::ops::Range;

use tracing::debug;

use super::lexer::{offset_at, Lexer, Token, TokenKind};
use super::{Batch, ParseError, RepeatPolicy};

/// Separator keyword used by sqlcmd and SSMS.
pub const DEFAULT_BATCH_SEPARATOR: &str = "GO";

/// Largest accepted `GO <count>`.
pub const MAX_REPEAT_COUNT: u32 = 10_000;

/// Splits T-SQL scripts into batches.
///
/// A separator is a line holding only the separator keyword (any case),
/// optionally followed by a repeat count and a `--` comment. The lines are
/// found on the token stream, so they are never matched inside a string,
/// identifier or comment.
#[derive(Debug, Clone)]
pub struct ScriptSplitter {
    separator: String,
    repeat_policy: RepeatPolicy,
}

impl Default for ScriptSplitter {
    fn default() -> Self {
        Self {
            separator: DEFAULT_BATCH_SEPARATOR.to_string(),
            repeat_policy: RepeatPolicy::default(),
        }
    }
}

impl ScriptSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different separator keyword (sqlcmd `-c`).
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_repeat_policy(mut self, policy: RepeatPolicy) -> Self {
        self.repeat_policy = policy;
        self
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn repeat_policy(&self) -> RepeatPolicy {
        self.repeat_policy
    }

    /// Split `script` into batches in source order.
    ///
    /// Each batch is an exact slice of `script`. The line break in front of
    /// a separator line belongs to neither batch, so `"A\nGO\nB"` yields `A`
    /// and `B`. With N separators there are N+1 source batches, some of
    /// which may be blank; `GO <count>` under [`RepeatPolicy::Expand`]
    /// repeats the preceding batch.
    ///
    /// # Errors
    ///
    /// Returns the first lexical or syntactic error in source order. No
    /// batches are returned in that case.
    pub fn split<'a>(&self, script: &'a str) -> Result<Vec<Batch<'a>>, ParseError> {
        match Lexer::new(script).tokenize() {
            Ok(tokens) => self.split_tokens(script, &tokens, true),
            Err(lexical) => {
                // A syntax error ahead of the lexical one comes first.
                let cuts = [
                    offset_at(script, lexical.line, lexical.column),
                    offset_at(script, lexical.line, 1),
                ];
                for cut in cuts {
                    let prefix = &script[..cut];
                    if let Ok(tokens) = Lexer::new(prefix).tokenize() {
                        self.split_tokens(prefix, &tokens, false)?;
                        break;
                    }
                }
                Err(lexical)
            }
        }
    }

    /// Walk `tokens` line by line. When `complete` is false the input stops
    /// early: its unterminated last line is plain content and the last batch
    /// is neither checked nor emitted.
    fn split_tokens<'a>(
        &self,
        script: &'a str,
        tokens: &[Token],
        complete: bool,
    ) -> Result<Vec<Batch<'a>>, ParseError> {
        let mut batches = Vec::new();
        let mut parens = ParenTracker::default();
        let mut index = 0;
        let mut batch_start = 0;
        let mut batch_line = 1;
        let mut line_start = 0;

        while line_start < tokens.len() {
            let line_end = tokens[line_start..]
                .iter()
                .position(|t| t.kind == TokenKind::LineBreak)
                .map_or(tokens.len(), |offset| line_start + offset);
            let content = &tokens[line_start..line_end];
            let line_break = tokens.get(line_end);

            let separator = if complete || line_break.is_some() {
                self.separator_line(script, content)
            } else {
                None
            };

            match separator {
                Some(count_token) => {
                    parens.finish()?;
                    let count = match count_token {
                        Some(token) => repeat_count(script, token)?,
                        None => 1,
                    };

                    // The previous token, if any, is the line break that
                    // ends the batch's last line.
                    let end = if line_start > 0 {
                        tokens[line_start - 1].start.max(batch_start)
                    } else {
                        0
                    };
                    self.push(&mut batches, script, batch_start..end, index, batch_line, count);
                    index += 1;

                    batch_start = line_break.map_or(script.len(), |t| t.end);
                    batch_line = line_break.map_or(content[0].line, |t| t.line + 1);
                }
                None => {
                    for token in content {
                        parens.track(token)?;
                    }
                }
            }

            line_start = line_end + 1;
        }

        if complete {
            parens.finish()?;
            self.push(&mut batches, script, batch_start..script.len(), index, batch_line, 1);
        }

        debug!(
            "Split script into {} batches ({} separators)",
            batches.len(),
            index
        );
        Ok(batches)
    }

    /// If `line` is a separator line, return its repeat count token, if any.
    fn separator_line<'t>(&self, script: &str, line: &'t [Token]) -> Option<Option<&'t Token>> {
        let mut tokens = line.iter().filter(|t| t.kind != TokenKind::Whitespace);

        let keyword = tokens.next()?;
        if keyword.kind != TokenKind::Word
            || !keyword.text(script).eq_ignore_ascii_case(&self.separator)
        {
            return None;
        }

        let mut next = tokens.next();
        let mut count_token = None;
        if let Some(token) = next {
            if token.kind == TokenKind::Number {
                if !token.text(script).bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                count_token = Some(token);
                next = tokens.next();
            }
        }

        match next {
            None => Some(count_token),
            Some(token) if token.kind == TokenKind::LineComment => Some(count_token),
            Some(_) => None,
        }
    }

    fn push<'a>(
        &self,
        batches: &mut Vec<Batch<'a>>,
        script: &'a str,
        span: Range<usize>,
        index: usize,
        line: usize,
        count: u32,
    ) {
        let copies = match self.repeat_policy {
            RepeatPolicy::Expand => count,
            RepeatPolicy::Ignore => 1,
        };
        let batch = Batch {
            text: &script[span.clone()],
            index,
            span,
            line,
        };
        for _ in 1..copies {
            batches.push(batch.clone());
        }
        batches.push(batch);
    }
}

fn repeat_count(script: &str, token: &Token) -> Result<u32, ParseError> {
    let text = token.text(script);
    match text.parse::<u32>() {
        Ok(count) if (1..=MAX_REPEAT_COUNT).contains(&count) => Ok(count),
        _ => Err(ParseError::new(
            format!(
                "invalid batch repeat count '{}': expected 1 to {}",
                text, MAX_REPEAT_COUNT
            ),
            token.line,
            token.column,
        )),
    }
}

/// Split with the default separator (`GO`) and repeat policy.
pub fn split_batches(script: &str) -> Result<Vec<Batch<'_>>, ParseError> {
    ScriptSplitter::default().split(script)
}

/// Checks that parentheses balance inside one batch.
#[derive(Default)]
struct ParenTracker {
    open: Vec<(usize, usize)>,
}

impl ParenTracker {
    fn track(&mut self, token: &Token) -> Result<(), ParseError> {
        match token.kind {
            TokenKind::OpenParen => self.open.push((token.line, token.column)),
            TokenKind::CloseParen => {
                if self.open.pop().is_none() {
                    return Err(ParseError::new(
                        "incorrect syntax near ')'",
                        token.line,
                        token.column,
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        match self.open.pop() {
            Some((line, column)) => Err(ParseError::new(
                "unclosed parenthesis at end of batch",
                line,
                column,
            )),
            None => Ok(()),
        }
    }
}
