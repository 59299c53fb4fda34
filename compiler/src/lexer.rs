// lexer.rs — Tokenizer for per-element kernel bodies
//
// Tokenizes Fortran subroutine text just far enough for the body scanner:
// identifiers, parentheses, separators and the statement structure. Uses
// the `logos` crate for DFA-based lexing. Keywords are case-insensitive.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use serde::Serialize;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Fortran token types.
///
/// Identifiers carry no value; use the span to retrieve the text from the
/// source. Comments (`!` to end of line) are skipped.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\f]+|![^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("subroutine", ignore(case))]
    Subroutine,
    #[token("end", ignore(case))]
    End,
    #[token("call", ignore(case))]
    Call,

    // ── Symbols ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token("::")]
    DoubleColon,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    /// Line continuation marker.
    #[token("&")]
    Amp,
    /// Derived-type component selector.
    #[token("%")]
    Percent,
    /// Arithmetic, relational and assignment operators.
    #[regex(r"\*\*|==|/=|<=|>=|=>|//|[-+*/=<>\[\]]")]
    Op,
    /// Dotted operators and logical literals (`.EQ.`, `.and.`, `.TRUE.`).
    #[regex(r"\.[a-zA-Z]+\.")]
    DotOp,

    // ── Literals ──
    /// Integer or real literal, with optional exponent and kind suffix.
    #[regex(r"([0-9]+(\.[0-9]*)?|\.[0-9]+)([eEdD][+-]?[0-9]+)?(_[a-zA-Z0-9]+)?")]
    Number,
    #[regex(r"'([^'\n]|'')*'")]
    #[regex(r#""([^"\n]|"")*""#)]
    StringLit,

    // ── Identifier ──
    //
    // Placed after keywords; fixed `#[token]` matches win over the regex for
    // the same length, so `call` is Call while `callback` is Ident.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ── Structure ──
    #[token("\n")]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::Subroutine => "subroutine",
            Token::End => "end",
            Token::Call => "call",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::DoubleColon => "::",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::Amp => "&",
            Token::Percent => "%",
            Token::Op => "operator",
            Token::DotOp => "dotted operator",
            Token::Number => "number",
            Token::StringLit => "string",
            Token::Ident => "identifier",
            Token::Newline => "newline",
        };
        write!(f, "{}", s)
    }
}

/// Lex a Fortran body into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──
