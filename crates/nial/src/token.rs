//! The token stream model shared by scanner, parser, deparser and descanner.

use serde::{Deserialize, Serialize};

/// Sub-kind of a constant token, decided by the accepting scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum ConstKind {
    /// Truth value or bit sequence (`l`, `o`, `llo`).
    Bool,
    Int,
    Real,
    /// Single character (`` `c ``).
    Char,
    /// String with doubled single-quote escape.
    Str,
    /// Single-quoted-leading phrase (`"word`).
    Phrase,
    /// Leading `?` fault literal.
    Fault,
}

/// Property of a token.
///
/// `Eol`, `Indent` and `Exdent` are formatting tokens: the scanner emits
/// `Eol` between source lines and the deparser emits all three to drive the
/// descanner's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenProp {
    Delim,
    Identifier,
    Comment,
    Eol,
    Indent,
    Exdent,
    Const(ConstKind),
}

/// One token: a property plus its printable text.
///
/// Constant tokens keep their raw source text (quotes and escapes included)
/// so that deparsed output re-scans to the same stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub prop: TokenProp,
    pub text: String,
}

impl Token {
    pub fn new(prop: TokenProp, text: impl Into<String>) -> Self {
        Self {
            prop,
            text: text.into(),
        }
    }

    /// True when this token is a delimiter with exactly the given text.
    #[must_use]
    pub fn is_delim(&self, text: &str) -> bool {
        self.prop == TokenProp::Delim && self.text == text
    }
}

/// A scanned or deparsed sequence of tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
}

impl TokenStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, prop: TokenProp, text: impl Into<String>) {
        self.tokens.push(Token::new(prop, text));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
