//! BQL lexer.
//!
//! Converts phrase text into a finite stream of tokens, tracking line and
//! column for diagnostics. The lexer never stops on bad input: malformed
//! literals and stray characters come back as [`TokenKind::Error`] and
//! scanning resumes after them.

use std::collections::HashSet;

use lazy_static::lazy_static;

lazy_static! {
    static ref KEYWORDS: HashSet<&'static str> = [
        // SQL core
        "ALL", "AND", "AS", "ASC", "BEGIN", "BETWEEN", "BY", "CASE", "CAST", "COLLATE",
        "COMMIT", "CREATE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "ESCAPE", "EXISTS",
        "FROM", "GLOB", "GROUP", "HAVING", "IF", "IN", "IS", "ISNULL", "LIKE", "LIMIT",
        "MATCH", "NOT", "NOTNULL", "NULL", "OFFSET", "OR", "ORDER", "REGEXP", "ROLLBACK",
        "SELECT", "TABLE", "TEMP", "TEMPORARY", "THEN", "TRANSACTION", "WHEN", "WHERE",
        "ALTER", "RENAME", "TO", "SET",
        // BQL
        "ACCURACY", "ADD", "ANALYZE", "AUTO", "CHECKPOINT", "COLUMNS", "CONFIDENCE",
        "CONTEXT", "CORRELATION", "DENSITY", "DEPENDENCE", "ESTIMATE", "EXISTING",
        "EXPLICIT", "FOR", "GENERATOR", "GIVEN", "GUESS", "HYPOTHETICAL", "IGNORE",
        "INFER", "INFORMATION", "INITIALIZE", "ITERATION", "ITERATIONS", "MINUTE",
        "MINUTES", "MODEL", "MODELED", "MODELS", "MUTUAL", "OF", "PAIRWISE", "POPULATION",
        "PREDICT", "PREDICTIVE", "PROBABILITY", "RELEVANCE", "ROWS", "SAMPLES", "SECOND",
        "SECONDS", "SIMILARITY", "SIMULATE", "STATTYPE", "STATTYPES", "THE", "USING",
        "VALUE", "VALUES", "VARIABLE", "VARIABLES", "WAIT", "WITH",
    ]
    .into_iter()
    .collect();
}

/// Case-insensitive keyword check.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(word.to_ascii_uppercase().as_str())
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// A recognised keyword, upper-cased.
    Keyword(String),
    Identifier(String),
    /// Double-quoted identifier with `""` escapes resolved.
    QuotedIdentifier(String),
    /// Single-quoted string with `''` escapes resolved.
    String(String),
    Blob(Vec<u8>),
    Integer(i64),
    Float(f64),
    /// `?` (None) or `?N` (Some(N)).
    NumberedParameter(Option<u32>),
    /// `:name`, `@name` or `$name`, spelled with its sigil.
    NamedParameter(String),
    LeftParen,
    RightParen,
    Comma,
    Dot,
    Semicolon,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ShiftLeft,
    ShiftRight,
    Ampersand,
    Pipe,
    Concat,
    Tilde,
    Eof,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offsets `[start, end)` into the source.
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            finished: false,
        }
    }

    /// Tokenize the entire input, ending with a single `Eof` token.
    pub fn tokenize(source: &str) -> Vec<Token> {
        Lexer::new(source).collect()
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let start = self.pos;
        let line = self.line;
        let col = self.col;
        let kind = match self.peek() {
            None => TokenKind::Eof,
            Some(ch) => self.lex_from(ch),
        };
        Token {
            kind,
            start,
            end: self.pos,
            line,
            col,
        }
    }

    fn lex_from(&mut self, ch: u8) -> TokenKind {
        match ch {
            b'\'' => self.lex_quoted(b'\'').map_or_else(
                || TokenKind::Error("unterminated string literal".to_string()),
                TokenKind::String,
            ),
            b'"' => self.lex_quoted(b'"').map_or_else(
                || TokenKind::Error("unterminated quoted identifier".to_string()),
                TokenKind::QuotedIdentifier,
            ),
            b'x' | b'X' if self.peek_at(1) == Some(b'\'') => self.lex_blob(),
            b'0'..=b'9' => self.lex_number(),
            b'.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_word(),
            b'?' => self.lex_question(),
            b':' | b'@' | b'$' => self.lex_named_parameter(),
            b'(' => self.single(TokenKind::LeftParen),
            b')' => self.single(TokenKind::RightParen),
            b',' => self.single(TokenKind::Comma),
            b'.' => self.single(TokenKind::Dot),
            b';' => self.single(TokenKind::Semicolon),
            b'*' => self.single(TokenKind::Star),
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'&' => self.single(TokenKind::Ampersand),
            b'~' => self.single(TokenKind::Tilde),
            b'=' => {
                self.advance();
                if self.peek() == Some(b'=') {
                    self.advance();
                }
                TokenKind::Eq
            }
            b'!' => {
                self.advance();
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::Ne
                } else {
                    TokenKind::Error("expected '=' after '!'".to_string())
                }
            }
            b'<' => {
                self.advance();
                match self.peek() {
                    Some(b'=') => self.single(TokenKind::Le),
                    Some(b'>') => self.single(TokenKind::Ne),
                    Some(b'<') => self.single(TokenKind::ShiftLeft),
                    _ => TokenKind::Lt,
                }
            }
            b'>' => {
                self.advance();
                match self.peek() {
                    Some(b'=') => self.single(TokenKind::Ge),
                    Some(b'>') => self.single(TokenKind::ShiftRight),
                    _ => TokenKind::Gt,
                }
            }
            b'|' => {
                self.advance();
                if self.peek() == Some(b'|') {
                    self.single(TokenKind::Concat)
                } else {
                    TokenKind::Pipe
                }
            }
            _ => {
                let rest = std::str::from_utf8(&self.src[self.pos..]).unwrap_or("");
                let shown = rest.chars().next().unwrap_or('\u{fffd}');
                // Skip the whole character, not just its first byte.
                let width = shown.len_utf8().max(1);
                for _ in 0..width {
                    self.advance();
                }
                TokenKind::Error(format!("unexpected character {shown:?}"))
            }
        }
    }

    fn advance(&mut self) -> u8 {
        let ch = self.src[self.pos];
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if ch & 0xC0 != 0x80 {
            self.col += 1;
        }
        ch
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
                self.advance();
            }
            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                while self.peek().is_some_and(|c| c != b'\n') {
                    self.advance();
                }
                continue;
            }
            if self.peek() == Some(b'/') && self.peek_at(1) == Some(b'*') {
                self.advance();
                self.advance();
                while self.peek().is_some() {
                    if self.peek() == Some(b'*') && self.peek_at(1) == Some(b'/') {
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    /// Reads a literal delimited by `quote`, where a doubled quote escapes
    /// itself. Returns None when the input ends first.
    fn lex_quoted(&mut self, quote: u8) -> Option<String> {
        self.advance();
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => return None,
                Some(c) if c == quote => {
                    self.advance();
                    if self.peek() == Some(quote) {
                        bytes.push(self.advance());
                    } else {
                        return Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                Some(_) => bytes.push(self.advance()),
            }
        }
    }

    fn lex_blob(&mut self) -> TokenKind {
        self.advance();
        let Some(hex) = self.lex_quoted(b'\'') else {
            return TokenKind::Error("unterminated blob literal".to_string());
        };
        if hex.len() % 2 != 0 {
            return TokenKind::Error("blob literal has an odd number of hex digits".to_string());
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            match hex.get(i..i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()) {
                Some(b) => bytes.push(b),
                None => return TokenKind::Error(format!("invalid hex digits in blob literal {hex:?}")),
            }
        }
        TokenKind::Blob(bytes)
    }

    fn lex_number(&mut self) -> TokenKind {
        let start = self.pos;
        if self.peek() == Some(b'0') && self.peek_at(1).is_some_and(|c| c == b'x' || c == b'X') {
            self.advance();
            self.advance();
            let digits = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let text = String::from_utf8_lossy(&self.src[digits..self.pos]).into_owned();
            return match i64::from_str_radix(&text, 16) {
                Ok(v) => TokenKind::Integer(v),
                Err(_) => TokenKind::Error(format!("malformed hex literal 0x{text}")),
            };
        }
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if self.peek().is_some_and(|c| c == b'e' || c == b'E') {
            is_float = true;
            self.advance();
            if self.peek().is_some_and(|c| c == b'+' || c == b'-') {
                self.advance();
            }
            let digits = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            if digits == self.pos {
                return TokenKind::Error("missing exponent digits".to_string());
            }
        }
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == b'_') {
            while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
                self.advance();
            }
            let text = String::from_utf8_lossy(&self.src[start..self.pos]);
            return TokenKind::Error(format!("malformed number {text}"));
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => TokenKind::Float(v),
                Err(_) => TokenKind::Error(format!("malformed number {text}")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => TokenKind::Integer(v),
                // Integers too large for i64 are reals, as in SQLite.
                Err(_) => text
                    .parse::<f64>()
                    .map_or_else(|_| TokenKind::Error(format!("malformed number {text}")), TokenKind::Float),
            }
        }
    }

    fn lex_word(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        let word = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if is_keyword(&word) {
            TokenKind::Keyword(word.to_ascii_uppercase())
        } else {
            TokenKind::Identifier(word)
        }
    }

    fn lex_question(&mut self) -> TokenKind {
        self.advance();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if start == self.pos {
            return TokenKind::NumberedParameter(None);
        }
        let digits = String::from_utf8_lossy(&self.src[start..self.pos]);
        match digits.parse::<u32>() {
            Ok(n) => TokenKind::NumberedParameter(Some(n)),
            Err(_) => TokenKind::Error(format!("parameter number ?{digits} out of range")),
        }
    }

    fn lex_named_parameter(&mut self) -> TokenKind {
        let start = self.pos;
        let sigil = self.advance();
        let name_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        if name_start == self.pos {
            return TokenKind::Error(format!("parameter {:?} has no name", sigil as char));
        }
        TokenKind::NamedParameter(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished {
            return None;
        }
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            self.finished = true;
        }
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Lexer::tokenize(text).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("estimate Foo"),
            vec![
                TokenKind::Keyword("ESTIMATE".into()),
                TokenKind::Identifier("Foo".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn quoting_regimes() {
        assert_eq!(
            kinds(r#""a""b" 'it''s' x'0aFF'"#),
            vec![
                TokenKind::QuotedIdentifier("a\"b".into()),
                TokenKind::String("it's".into()),
                TokenKind::Blob(vec![0x0a, 0xff]),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn parameter_spellings() {
        assert_eq!(
            kinds("? ?7 :a @b $c"),
            vec![
                TokenKind::NumberedParameter(None),
                TokenKind::NumberedParameter(Some(7)),
                TokenKind::NamedParameter(":a".into()),
                TokenKind::NamedParameter("@b".into()),
                TokenKind::NamedParameter("$c".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn bad_input_yields_error_and_continues() {
        let tokens = kinds("select # 1 x'abc'");
        assert!(matches!(tokens[1], TokenKind::Error(_)));
        assert_eq!(tokens[2], TokenKind::Integer(1));
        assert!(matches!(tokens[3], TokenKind::Error(_)));
        assert_eq!(tokens[4], TokenKind::Eof);
    }

    #[test]
    fn numbers_and_comments() {
        assert_eq!(
            kinds("1 2.5 1e3 -- gone\n/* also */ .5"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Float(2.5),
                TokenKind::Float(1000.0),
                TokenKind::Float(0.5),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = Lexer::tokenize("a\n  b");
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }
}
