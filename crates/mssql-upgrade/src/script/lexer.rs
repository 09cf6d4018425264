//! T-SQL token stream for the splitter.
//!
//! Tokenizing is done by `sqlparser` with [`MsSqlDialect`]. Its tokens carry
//! 1-based line/column locations; this module turns them into byte ranges of
//! the script so batches can be sliced without copying. Every construct that
//! can hide a batch separator (string literals, quoted and bracketed
//! identifiers, line and block comments) arrives as a single token, so a `GO`
//! inside one of them is never seen as a word.

use std::iter::Peekable;
use std::str::CharIndices;

use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{
    Location, Token as SqlToken, TokenWithLocation, Tokenizer, Whitespace,
};

use super::ParseError;

/// Lexical category of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Spaces and tabs.
    Whitespace,
    /// `\n`, `\r\n` or a lone `\r`.
    LineBreak,
    /// `-- ...` up to the line break.
    LineComment,
    /// `/* ... */`, possibly nested and spanning lines.
    BlockComment,
    /// `'...'` or `N'...'`.
    StringLiteral,
    /// `"..."` or `[...]`.
    QuotedIdentifier,
    /// Keyword, identifier, `@variable` or `#temp` name.
    Word,
    /// Numeric literal.
    Number,
    OpenParen,
    CloseParen,
    /// Operators, punctuation and anything else.
    Symbol,
}

/// Token with position information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// 1-based line of the first character.
    pub line: usize,
    /// 1-based column (in characters) of the first character.
    pub column: usize,
}

impl Token {
    /// The token's text within `source`.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// Tokenizer over a T-SQL script.
pub struct Lexer<'a> {
    input: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input }
    }

    /// Tokenize the entire input, stopping at the first lexical error.
    pub fn tokenize(self) -> Result<Vec<Token>, ParseError> {
        let dialect = MsSqlDialect {};
        let located = Tokenizer::new(&dialect, self.input)
            .tokenize_with_location()
            .map_err(|e| {
                ParseError::new(
                    e.message,
                    e.location.line as usize,
                    e.location.column as usize,
                )
            })?;

        let mut cursor = OffsetCursor::new(self.input);
        let starts: Vec<usize> = located
            .iter()
            .map(|t| cursor.offset_of(t.location))
            .collect();

        let mut tokens = Vec::with_capacity(located.len());
        for (i, TokenWithLocation { token, location }) in located.iter().enumerate() {
            let start = starts[i];
            let end = starts.get(i + 1).copied().unwrap_or(self.input.len());
            if start == end {
                continue;
            }
            let line = location.line as usize;
            let column = location.column as usize;

            match token {
                // sqlparser keeps the line break inside a `--` comment.
                SqlToken::Whitespace(Whitespace::SingleLineComment { .. }) => {
                    let text = &self.input[start..end];
                    let body = text.trim_end_matches(['\r', '\n']);
                    let split = start + body.len();
                    tokens.push(Token {
                        kind: TokenKind::LineComment,
                        start,
                        end: split,
                        line,
                        column,
                    });
                    if split < end {
                        tokens.push(Token {
                            kind: TokenKind::LineBreak,
                            start: split,
                            end,
                            line,
                            column: column + body.chars().count(),
                        });
                    }
                }
                _ => tokens.push(Token {
                    kind: kind_of(token),
                    start,
                    end,
                    line,
                    column,
                }),
            }
        }
        Ok(tokens)
    }
}

fn kind_of(token: &SqlToken) -> TokenKind {
    match token {
        SqlToken::Whitespace(Whitespace::Newline) => TokenKind::LineBreak,
        SqlToken::Whitespace(Whitespace::MultiLineComment(_)) => TokenKind::BlockComment,
        SqlToken::Whitespace(Whitespace::SingleLineComment { .. }) => TokenKind::LineComment,
        SqlToken::Whitespace(_) => TokenKind::Whitespace,
        SqlToken::Word(word) if word.quote_style.is_some() => TokenKind::QuotedIdentifier,
        SqlToken::Word(_) => TokenKind::Word,
        SqlToken::Number(..) => TokenKind::Number,
        SqlToken::SingleQuotedString(_) | SqlToken::NationalStringLiteral(_) => {
            TokenKind::StringLiteral
        }
        SqlToken::LParen => TokenKind::OpenParen,
        SqlToken::RParen => TokenKind::CloseParen,
        _ => TokenKind::Symbol,
    }
}

/// Maps sqlparser locations to byte offsets. Locations must be visited in
/// increasing order.
///
/// Lines advance on `\n` only and every other character is one column,
/// matching how the tokenizer counts.
struct OffsetCursor<'a> {
    chars: Peekable<CharIndices<'a>>,
    len: usize,
    line: u64,
    column: u64,
}

impl<'a> OffsetCursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            len: input.len(),
            line: 1,
            column: 1,
        }
    }

    fn offset_of(&mut self, location: Location) -> usize {
        while (self.line, self.column) < (location.line, location.column) {
            match self.chars.next() {
                Some((_, '\n')) => {
                    self.line += 1;
                    self.column = 1;
                }
                Some(_) => self.column += 1,
                None => return self.len,
            }
        }
        self.chars.peek().map_or(self.len, |&(offset, _)| offset)
    }
}

/// Byte offset of a 1-based line/column position in `input`.
pub(super) fn offset_at(input: &str, line: usize, column: usize) -> usize {
    OffsetCursor::new(input).offset_of(Location {
        line: line as u64,
        column: column as u64,
    })
}
