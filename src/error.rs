use std::fmt;
use thiserror::Error;

/// Whether a diagnostic came from the lexer or the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lexical,
    Syntax,
}

/// One problem found while scanning BQL text. Diagnostics are collected
/// across a whole input and reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DiagnosticKind::Lexical => "lexical error",
            DiagnosticKind::Syntax => "syntax error",
        };
        write!(f, "{} at {}:{}: {}", kind, self.line, self.col, self.message)
    }
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum BqlError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Parse error: {}", join_diagnostics(.diagnostics))]
    Parse { diagnostics: Vec<Diagnostic> },
    #[error("Compile error: {0}")]
    Compile(String),
    #[error("Binding error: {0}")]
    Bind(String),
    #[error("Catalog error: {0}")]
    Catalog(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("SQL error: {0}")]
    Sql(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, BqlError>;

impl BqlError {
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile(message.into())
    }
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

// Helper conversions
impl From<rusqlite::Error> for BqlError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e.to_string())
    }
}

impl From<config::ConfigError> for BqlError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for BqlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invariant(format!("malformed JSON: {e}"))
    }
}

impl From<BqlError> for rusqlite::Error {
    fn from(e: BqlError) -> Self {
        rusqlite::Error::UserFunctionError(Box::new(e))
    }
}
