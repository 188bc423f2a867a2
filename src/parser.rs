//! BQL parser.
//!
//! Input text is pulled through the [`Lexer`] and cut into phrases at
//! top-level semicolons. Each phrase is numbered for parameters from its
//! tokens, parsed with the pest grammar in `grammar.pest`, and turned into
//! an AST by the builder functions below.
//!
//! Diagnostics never abort the scan. Once one has been recorded, later
//! phrases are still checked but no longer yielded, and a single
//! [`BqlError::Parse`] carrying every diagnostic is produced at the end.

use std::collections::HashMap;

use bimap::BiMap;
use lazy_static::lazy_static;
use pest::Parser;
use pest::error::{InputLocation, LineColLocation};
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op as Affix, PrattParser};
use pest_derive::Parser;
use roaring::RoaringBitmap;
use tracing::trace;

use crate::ast::{
    AlterGenerator, AlterPopulation, AnalyzeModels, BqlFn, ColumnList, ColumnSubset, Command,
    Estimate, EstimateBy, EstimateColumns, EstimatePairwiseColumns, EstimatePairwiseRows, Expr,
    FromItem, InferAuto, InferColumn, InferExplicit, Limit, Literal, ModelSelection, Op,
    OrderItem, ParsedPhrase, Phrase, PopulationClause, Query, SchemaToken, Select, SelectColumn,
    Simulate, SimulateModels,
};
use crate::error::{BqlError, Diagnostic, DiagnosticKind, Result};
use crate::lexer::{Lexer, Token, TokenKind};

/// Largest parameter number SQLite accepts by default.
pub const MAX_PARAMETER: usize = 32766;

#[derive(Parser)]
#[grammar = "grammar.pest"]
pub struct BqlGrammar;

lazy_static! {
    static ref PRATT: PrattParser<Rule> = PrattParser::new()
        .op(Affix::infix(Rule::op_or, Assoc::Left))
        .op(Affix::infix(Rule::op_and, Assoc::Left))
        .op(Affix::prefix(Rule::op_not))
        .op(Affix::infix(Rule::op_eq, Assoc::Left)
            | Affix::infix(Rule::op_ne, Assoc::Left)
            | Affix::infix(Rule::op_is, Assoc::Left)
            | Affix::infix(Rule::op_isnot, Assoc::Left)
            | Affix::infix(Rule::op_like, Assoc::Left)
            | Affix::postfix(Rule::op_between)
            | Affix::postfix(Rule::op_in)
            | Affix::postfix(Rule::op_isnull)
            | Affix::postfix(Rule::op_notnull))
        .op(Affix::infix(Rule::op_lt, Assoc::Left)
            | Affix::infix(Rule::op_le, Assoc::Left)
            | Affix::infix(Rule::op_gt, Assoc::Left)
            | Affix::infix(Rule::op_ge, Assoc::Left))
        .op(Affix::infix(Rule::op_bitand, Assoc::Left)
            | Affix::infix(Rule::op_bitor, Assoc::Left)
            | Affix::infix(Rule::op_shl, Assoc::Left)
            | Affix::infix(Rule::op_shr, Assoc::Left))
        .op(Affix::infix(Rule::op_add, Assoc::Left) | Affix::infix(Rule::op_sub, Assoc::Left))
        .op(Affix::infix(Rule::op_mul, Assoc::Left)
            | Affix::infix(Rule::op_div, Assoc::Left)
            | Affix::infix(Rule::op_rem, Assoc::Left))
        .op(Affix::infix(Rule::op_concat, Assoc::Left))
        .op(Affix::postfix(Rule::op_collate))
        .op(Affix::prefix(Rule::op_neg) | Affix::prefix(Rule::op_pos) | Affix::prefix(Rule::op_bitnot));
}

/// Parses every phrase of `text`.
pub fn parse_bql_string(text: &str) -> Result<Vec<ParsedPhrase>> {
    phrases(text).collect()
}

/// Parses text that must hold exactly one phrase.
pub fn parse_bql_phrase(text: &str) -> Result<ParsedPhrase> {
    let mut all = parse_bql_string(text)?;
    match all.len() {
        1 => Ok(all.remove(0)),
        0 => Err(BqlError::compile("no phrase to execute")),
        n => Err(BqlError::compile(format!(
            "expected a single phrase, found {n}"
        ))),
    }
}

/// A lazy sequence of the phrases in `text`. Each call starts a fresh scan.
pub fn phrases(text: &str) -> Phrases<'_> {
    Phrases {
        source: text,
        lexer: Lexer::new(text),
        diagnostics: Vec::new(),
        exhausted: false,
    }
}

pub struct Phrases<'a> {
    source: &'a str,
    lexer: Lexer<'a>,
    diagnostics: Vec<Diagnostic>,
    exhausted: bool,
}

impl Phrases<'_> {
    /// Pulls tokens up to the next top-level semicolon. The flag is true
    /// when the end of input stood in for the terminator.
    fn next_chunk(&mut self) -> (Vec<Token>, bool) {
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        loop {
            let token = self.lexer.next_token();
            match token.kind {
                TokenKind::Eof => return (tokens, true),
                TokenKind::Semicolon if depth == 0 => return (tokens, false),
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => depth = depth.saturating_sub(1),
                _ => {}
            }
            tokens.push(token);
        }
    }
}

impl Iterator for Phrases<'_> {
    type Item = Result<ParsedPhrase>;

    fn next(&mut self) -> Option<Result<ParsedPhrase>> {
        while !self.exhausted {
            let (tokens, at_end) = self.next_chunk();
            if at_end {
                self.exhausted = true;
            }
            if tokens.is_empty() {
                continue;
            }
            match parse_chunk(self.source, &tokens) {
                Ok(phrase) if self.diagnostics.is_empty() => return Some(Ok(phrase)),
                Ok(_) => trace!("suppressing phrase after earlier diagnostics"),
                Err(mut found) => self.diagnostics.append(&mut found),
            }
        }
        if self.diagnostics.is_empty() {
            None
        } else {
            Some(Err(BqlError::Parse {
                diagnostics: std::mem::take(&mut self.diagnostics),
            }))
        }
    }
}

/// True when `text` ends in a terminated phrase, or already holds a syntax
/// error that more input cannot repair.
pub fn is_complete(text: &str) -> bool {
    let tokens = Lexer::tokenize(text);
    let mut depth = 0usize;
    let mut phrase_start = 0usize;
    let mut terminated = false;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Semicolon if depth == 0 => {
                phrase_start = i + 1;
                terminated = true;
            }
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen => depth = depth.saturating_sub(1),
            // An unterminated quote runs to the end and may yet be closed.
            TokenKind::Error(_) if token.end == text.len() => return false,
            _ => {}
        }
    }
    let pending: Vec<&Token> = tokens[phrase_start..]
        .iter()
        .filter(|t| t.kind != TokenKind::Eof)
        .collect();
    let Some(first) = pending.first() else {
        return terminated;
    };
    if pending.iter().any(|t| matches!(t.kind, TokenKind::Error(_))) {
        return true;
    }
    let rest = &text[first.start..];
    match BqlGrammar::parse(Rule::phrase, rest) {
        Ok(_) => false,
        Err(e) => {
            let pos = match e.location {
                InputLocation::Pos(p) => p,
                InputLocation::Span((p, _)) => p,
            };
            !rest.get(pos..).unwrap_or("").trim().is_empty()
        }
    }
}

fn parse_chunk(
    source: &str,
    tokens: &[Token],
) -> std::result::Result<ParsedPhrase, Vec<Diagnostic>> {
    let lexical: Vec<Diagnostic> = tokens
        .iter()
        .filter_map(|t| match &t.kind {
            TokenKind::Error(message) => Some(Diagnostic {
                kind: DiagnosticKind::Lexical,
                message: message.clone(),
                line: t.line,
                col: t.col,
            }),
            _ => None,
        })
        .collect();
    if !lexical.is_empty() {
        return Err(lexical);
    }
    let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
        return Err(Vec::new());
    };
    let text = &source[first.start..last.end];
    let numbering = Numbering::assign(tokens, first.start)?;
    let mut pairs = BqlGrammar::parse(Rule::phrase, text)
        .map_err(|e| vec![syntax_diagnostic(e, first)])?;
    let builder = Builder {
        numbering: &numbering,
        line: first.line,
        col: first.col,
    };
    let phrase = match pairs.next() {
        Some(pair) => builder.phrase(pair).map_err(|d| vec![d])?,
        None => {
            return Err(vec![Diagnostic {
                kind: DiagnosticKind::Syntax,
                message: "empty phrase".to_string(),
                line: first.line,
                col: first.col,
            }]);
        }
    };
    Ok(numbering.wrap(phrase))
}

fn locate(line: usize, col: usize, at: (usize, usize)) -> (usize, usize) {
    match at {
        (1, c) => (line, col + c - 1),
        (l, c) => (line + l - 1, c),
    }
}

fn rule_label(rule: &Rule) -> String {
    let name = format!("{rule:?}");
    match name.strip_prefix("kw_") {
        Some(keyword) => keyword.to_ascii_uppercase(),
        None => name.replace('_', " "),
    }
}

fn syntax_diagnostic(error: pest::error::Error<Rule>, first: &Token) -> Diagnostic {
    let error = error.renamed_rules(rule_label);
    let at = match error.line_col {
        LineColLocation::Pos(at) => at,
        LineColLocation::Span(at, _) => at,
    };
    let (line, col) = locate(first.line, first.col, at);
    Diagnostic {
        kind: DiagnosticKind::Syntax,
        message: error.variant.message().into_owned(),
        line,
        col,
    }
}

/// Parameter numbers of one phrase, keyed by each parameter's byte offset
/// within the phrase text.
struct Numbering {
    numbers: HashMap<usize, usize>,
    n_numpar: usize,
    nampar_map: BiMap<String, usize>,
}

impl Numbering {
    fn assign(tokens: &[Token], base: usize) -> std::result::Result<Numbering, Vec<Diagnostic>> {
        let mut numbering = Numbering {
            numbers: HashMap::new(),
            n_numpar: 0,
            nampar_map: BiMap::new(),
        };
        let mut diagnostics = Vec::new();
        for token in tokens {
            let number = match &token.kind {
                TokenKind::NumberedParameter(None) => numbering.n_numpar + 1,
                TokenKind::NumberedParameter(Some(n)) => *n as usize,
                TokenKind::NamedParameter(name) => match numbering.nampar_map.get_by_left(name) {
                    Some(&n) => n,
                    None => {
                        let n = numbering.n_numpar + 1;
                        numbering.nampar_map.insert(name.clone(), n);
                        n
                    }
                },
                _ => continue,
            };
            if number == 0 || number > MAX_PARAMETER {
                diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Syntax,
                    message: format!("parameter number {number} out of range 1..={MAX_PARAMETER}"),
                    line: token.line,
                    col: token.col,
                });
                continue;
            }
            numbering.n_numpar = numbering.n_numpar.max(number);
            numbering.numbers.insert(token.start - base, number);
        }
        if diagnostics.is_empty() {
            Ok(numbering)
        } else {
            Err(diagnostics)
        }
    }

    fn wrap(self, phrase: Phrase) -> ParsedPhrase {
        if self.numbers.is_empty() {
            ParsedPhrase::Bare(phrase)
        } else {
            ParsedPhrase::Parametrized {
                phrase,
                n_numpar: self.n_numpar,
                nampar_map: self.nampar_map,
            }
        }
    }
}

type Built<T> = std::result::Result<T, Diagnostic>;

/// Clauses shared by the row-, column- and model-sourced query forms.
#[derive(Default)]
struct Clauses {
    population: Option<String>,
    models: ModelSelection,
    subset: Option<ColumnSubset>,
    condition: Option<Expr>,
    group_by: Option<Vec<Expr>>,
    having: Option<Expr>,
    order_by: Option<Vec<OrderItem>>,
    limit: Option<Limit>,
}

struct Builder<'n> {
    numbering: &'n Numbering,
    line: usize,
    col: usize,
}

impl Builder<'_> {
    fn error(&self, pair: &Pair<'_, Rule>, message: impl Into<String>) -> Diagnostic {
        let (line, col) = locate(self.line, self.col, pair.line_col());
        Diagnostic {
            kind: DiagnosticKind::Syntax,
            message: message.into(),
            line,
            col,
        }
    }

    fn phrase(&self, pair: Pair<'_, Rule>) -> Built<Phrase> {
        let outer = pair.clone();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::EOI => {}
                Rule::select | Rule::estimate | Rule::infer | Rule::simulate => {
                    return Ok(Phrase::Query(self.query(inner)?));
                }
                _ => return Ok(Phrase::Command(self.command(inner)?)),
            }
        }
        Err(self.error(&outer, "empty phrase"))
    }

    // ------------------------------------------------------------ names

    fn name(&self, pair: Pair<'_, Rule>) -> Built<String> {
        let outer = pair.clone();
        let inner = pair
            .into_inner()
            .next()
            .ok_or_else(|| self.error(&outer, "expected a name"))?;
        Ok(match inner.as_rule() {
            Rule::quoted_ident => unquote(inner.as_str(), '"'),
            _ => inner.as_str().to_string(),
        })
    }

    fn names(&self, pair: Pair<'_, Rule>) -> Built<Vec<String>> {
        pair.into_inner()
            .filter(|p| p.as_rule() == Rule::name)
            .map(|p| self.name(p))
            .collect()
    }

    /// The names directly inside `pair`, whether single or in a list.
    fn name_operands(&self, pair: Pair<'_, Rule>) -> Built<Vec<String>> {
        let mut names = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::name => names.push(self.name(inner)?),
                Rule::name_list => names.extend(self.names(inner)?),
                _ => {}
            }
        }
        Ok(names)
    }

    fn first_name(&self, pair: Pair<'_, Rule>) -> Built<String> {
        let outer = pair.clone();
        match pair.into_inner().find(|p| p.as_rule() == Rule::name) {
            Some(name) => self.name(name),
            None => Err(self.error(&outer, "expected a name")),
        }
    }

    fn integer(&self, pair: &Pair<'_, Rule>) -> Built<i64> {
        parse_integer(pair.as_str())
            .ok_or_else(|| self.error(pair, format!("integer {} out of range", pair.as_str())))
    }

    fn count(&self, pair: &Pair<'_, Rule>) -> Built<u64> {
        let n = self.integer(pair)?;
        u64::try_from(n).map_err(|_| self.error(pair, format!("expected a non-negative count, found {n}")))
    }

    fn find_integer(&self, pair: Pair<'_, Rule>) -> Built<i64> {
        let outer = pair.clone();
        match pair.into_inner().find(|p| p.as_rule() == Rule::integer) {
            Some(n) => self.integer(&n),
            None => Err(self.error(&outer, "expected an integer")),
        }
    }

    // ------------------------------------------------------- expressions

    fn expression(&self, pair: Pair<'_, Rule>) -> Built<Expr> {
        PRATT
            .map_primary(|primary| self.primary(primary))
            .map_prefix(|op, rhs| {
                let op = match op.as_rule() {
                    Rule::op_not => Op::Not,
                    Rule::op_neg => Op::Neg,
                    Rule::op_pos => Op::Plus,
                    Rule::op_bitnot => Op::BitNot,
                    _ => return Err(self.error(&op, "unexpected prefix operator")),
                };
                Ok(Expr::Op(op, vec![rhs?]))
            })
            .map_postfix(|lhs, op| self.postfix(lhs?, op))
            .map_infix(|lhs, op, rhs| {
                let op = self.infix(&op)?;
                Ok(Expr::Op(op, vec![lhs?, rhs?]))
            })
            .parse(pair.into_inner())
    }

    fn expressions(&self, pair: Pair<'_, Rule>) -> Built<Vec<Expr>> {
        pair.into_inner()
            .filter(|p| p.as_rule() == Rule::expression)
            .map(|p| self.expression(p))
            .collect()
    }

    fn infix(&self, op: &Pair<'_, Rule>) -> Built<Op> {
        Ok(match op.as_rule() {
            Rule::op_or => Op::Or,
            Rule::op_and => Op::And,
            Rule::op_isnot => Op::IsNot,
            Rule::op_is => Op::Is,
            Rule::op_eq => Op::Eq,
            Rule::op_ne => Op::Ne,
            Rule::op_le => Op::Le,
            Rule::op_ge => Op::Ge,
            Rule::op_lt => Op::Lt,
            Rule::op_gt => Op::Gt,
            Rule::op_shl => Op::Shl,
            Rule::op_shr => Op::Shr,
            Rule::op_concat => Op::Concat,
            Rule::op_bitor => Op::BitOr,
            Rule::op_bitand => Op::BitAnd,
            Rule::op_add => Op::Add,
            Rule::op_sub => Op::Sub,
            Rule::op_mul => Op::Mul,
            Rule::op_div => Op::Div,
            Rule::op_rem => Op::Rem,
            Rule::op_like => {
                let mut negated = false;
                let mut kind = Op::Like;
                for kw in op.clone().into_inner() {
                    match kw.as_rule() {
                        Rule::kw_not => negated = true,
                        Rule::kw_glob => kind = Op::Glob,
                        Rule::kw_regexp => kind = Op::Regexp,
                        Rule::kw_match => kind = Op::Match,
                        _ => {}
                    }
                }
                match (kind, negated) {
                    (Op::Glob, true) => Op::NotGlob,
                    (Op::Regexp, true) => Op::NotRegexp,
                    (Op::Match, true) => Op::NotMatch,
                    (_, true) => Op::NotLike,
                    (op, false) => op,
                }
            }
            _ => return Err(self.error(op, "unexpected operator")),
        })
    }

    fn postfix(&self, lhs: Expr, op: Pair<'_, Rule>) -> Built<Expr> {
        match op.as_rule() {
            Rule::op_isnull => Ok(Expr::Op(Op::IsNull, vec![lhs])),
            Rule::op_notnull => Ok(Expr::Op(Op::NotNull, vec![lhs])),
            Rule::op_collate => Ok(Expr::Collate(Box::new(lhs), self.first_name(op)?)),
            Rule::op_between => {
                let mut negated = false;
                let mut bounds = Vec::new();
                for inner in op.into_inner() {
                    match inner.as_rule() {
                        Rule::kw_not => negated = true,
                        Rule::arith => bounds.push(self.expression(inner)?),
                        _ => {}
                    }
                }
                let op = if negated { Op::NotBetween } else { Op::Between };
                let mut operands = vec![lhs];
                operands.extend(bounds);
                Ok(Expr::Op(op, operands))
            }
            Rule::op_in => {
                let mut negated = false;
                let mut list = Vec::new();
                for inner in op.into_inner() {
                    match inner.as_rule() {
                        Rule::kw_not => negated = true,
                        Rule::kw_in => {}
                        Rule::expression_list => list = self.expressions(inner)?,
                        _ => {
                            return Ok(Expr::InQuery {
                                expr: Box::new(lhs),
                                negated,
                                query: Box::new(self.query(inner)?),
                            });
                        }
                    }
                }
                Ok(Expr::InList {
                    expr: Box::new(lhs),
                    negated,
                    list,
                })
            }
            _ => Err(self.error(&op, "unexpected postfix operator")),
        }
    }

    fn primary(&self, pair: Pair<'_, Rule>) -> Built<Expr> {
        match pair.as_rule() {
            Rule::paren_query | Rule::exists_expr => {
                let exists = pair.as_rule() == Rule::exists_expr;
                let outer = pair.clone();
                let query = pair
                    .into_inner()
                    .find(|p| is_query_rule(p.as_rule()))
                    .ok_or_else(|| self.error(&outer, "expected a query"))?;
                let query = Box::new(self.query(query)?);
                Ok(if exists { Expr::Exists(query) } else { Expr::Sub(query) })
            }
            Rule::paren_expr => self.expression(self.only_inner(pair)?),
            Rule::case_expr => self.case(pair),
            Rule::cast_expr => {
                let mut expr = None;
                let mut type_name = String::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::expression => expr = Some(self.expression(inner)?),
                        Rule::type_name => {
                            type_name = inner.as_str().split_whitespace().collect::<Vec<_>>().join(" ")
                        }
                        _ => {}
                    }
                }
                Ok(Expr::Cast(Box::new(expr.unwrap_or(Expr::Lit(Literal::Null))), type_name))
            }
            Rule::null_lit => Ok(Expr::Lit(Literal::Null)),
            Rule::float => pair
                .as_str()
                .parse::<f64>()
                .map(|v| Expr::Lit(Literal::Float(v)))
                .map_err(|_| self.error(&pair, format!("malformed number {}", pair.as_str()))),
            Rule::integer => Ok(Expr::Lit(match parse_integer(pair.as_str()) {
                Some(v) => Literal::Integer(v),
                // Too large for an integer: SQLite reads it as a real.
                None => Literal::Float(
                    pair.as_str()
                        .parse::<f64>()
                        .map_err(|_| self.error(&pair, format!("malformed number {}", pair.as_str())))?,
                ),
            })),
            Rule::string => Ok(Expr::Lit(Literal::String(unquote(pair.as_str(), '\'')))),
            Rule::blob => {
                let text = pair.as_str();
                let hex = &text[2..text.len() - 1];
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                    .collect::<std::result::Result<Vec<u8>, _>>()
                    .map_err(|_| self.error(&pair, "malformed blob literal"))?;
                Ok(Expr::Lit(Literal::Blob(bytes)))
            }
            Rule::numpar => Ok(Expr::NumPar(self.parameter(&pair)?)),
            Rule::nampar => Ok(Expr::NamPar(self.parameter(&pair)?, pair.as_str().to_string())),
            Rule::application => self.application(pair),
            Rule::column_ref => {
                let mut names = Vec::new();
                for inner in pair.clone().into_inner() {
                    names.push(self.name(inner)?);
                }
                match names.len() {
                    1 => Ok(Expr::column(names.remove(0))),
                    2 => {
                        let column = names.remove(1);
                        Ok(Expr::Col {
                            table: Some(names.remove(0)),
                            column,
                        })
                    }
                    _ => Err(self.error(&pair, "malformed column reference")),
                }
            }
            _ => Ok(Expr::Bql(Box::new(self.bql_fn(pair)?))),
        }
    }

    fn only_inner<'i>(&self, pair: Pair<'i, Rule>) -> Built<Pair<'i, Rule>> {
        let outer = pair.clone();
        pair.into_inner()
            .next()
            .ok_or_else(|| self.error(&outer, "expected an expression"))
    }

    fn parameter(&self, pair: &Pair<'_, Rule>) -> Built<usize> {
        self.numbering
            .numbers
            .get(&pair.as_span().start())
            .copied()
            .ok_or_else(|| self.error(pair, format!("unnumbered parameter {}", pair.as_str())))
    }

    fn case(&self, pair: Pair<'_, Rule>) -> Built<Expr> {
        let mut key = None;
        let mut whens = Vec::new();
        let mut otherwise = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::case_key => key = Some(Box::new(self.arith_of(inner)?)),
                Rule::case_when => {
                    let span = inner.clone();
                    let mut parts = self.expressions(inner)?;
                    if parts.len() != 2 {
                        return Err(self.error(&span, "WHEN needs a condition and a result"));
                    }
                    let then = parts.remove(1);
                    whens.push((parts.remove(0), then));
                }
                Rule::case_else => otherwise = Some(Box::new(self.arith_of(inner)?)),
                _ => {}
            }
        }
        Ok(Expr::Case {
            key,
            whens,
            otherwise,
        })
    }

    fn application(&self, pair: Pair<'_, Rule>) -> Built<Expr> {
        let mut name = String::new();
        let mut distinct = false;
        let mut args = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::name => name = self.name(inner)?,
                Rule::app_star => return Ok(Expr::AppStar(name)),
                Rule::kw_distinct => distinct = true,
                Rule::expression_list => args = self.expressions(inner)?,
                _ => {}
            }
        }
        Ok(Expr::App {
            name,
            distinct,
            args,
        })
    }

    fn constraint(&self, pair: Pair<'_, Rule>) -> Built<(String, Expr)> {
        let mut name = None;
        let mut value = None;
        let outer = pair.clone();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::name => name = Some(self.name(inner)?),
                Rule::arith => value = Some(self.expression(inner)?),
                _ => {}
            }
        }
        match (name, value) {
            (Some(name), Some(value)) => Ok((name, value)),
            _ => Err(self.error(&outer, "malformed constraint")),
        }
    }

    fn constraints(&self, pair: Pair<'_, Rule>) -> Built<Vec<(String, Expr)>> {
        let mut constraints = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::constraint => constraints.push(self.constraint(inner)?),
                Rule::constraint_list | Rule::given_list | Rule::hyp_row => {
                    constraints.extend(self.constraints(inner)?)
                }
                _ => {}
            }
        }
        Ok(constraints)
    }

    fn arith_of(&self, pair: Pair<'_, Rule>) -> Built<Expr> {
        let outer = pair.clone();
        match pair
            .into_inner()
            .find(|p| matches!(p.as_rule(), Rule::arith | Rule::expression))
        {
            Some(e) => self.expression(e),
            None => Err(self.error(&outer, "expected an expression")),
        }
    }

    fn column_operand(&self, pair: Pair<'_, Rule>) -> Built<ColumnList> {
        let outer = pair.clone();
        let operand = self.only_inner(pair)?;
        match operand.as_rule() {
            Rule::star => Ok(ColumnList::All),
            Rule::name => Ok(ColumnList::Names(vec![self.name(operand)?])),
            Rule::name_list => Ok(ColumnList::Names(self.names(operand)?)),
            _ => Err(self.error(&outer, "expected columns")),
        }
    }

    fn bql_fn(&self, pair: Pair<'_, Rule>) -> Built<BqlFn> {
        let rule = pair.as_rule();
        let outer = pair.clone();
        match rule {
            Rule::predprob_fn => {
                let mut targets = Vec::new();
                let mut constraints = None;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::name => targets.push(self.name(inner)?),
                        Rule::name_list => targets.extend(self.names(inner)?),
                        Rule::predprob_given => {
                            let given = self.only_inner_after_keywords(inner)?;
                            constraints = Some(match given.as_rule() {
                                Rule::star => ColumnList::All,
                                _ => ColumnList::Names(self.names(given)?),
                            });
                        }
                        _ => {}
                    }
                }
                Ok(BqlFn::PredProb {
                    targets,
                    constraints,
                })
            }
            Rule::probdensity_value_fn => {
                let mut value = None;
                let mut constraints = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::arith => value = Some(self.expression(inner)?),
                        Rule::given_list => constraints = self.constraints(inner)?,
                        _ => {}
                    }
                }
                Ok(BqlFn::ProbDensityValue {
                    value: value.ok_or_else(|| self.error(&outer, "expected a value"))?,
                    constraints,
                })
            }
            Rule::probdensity_fn => {
                let mut targets = Vec::new();
                let mut constraints = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::constraint => targets.push(self.constraint(inner)?),
                        Rule::constraint_list => targets = self.constraints(inner)?,
                        Rule::given_list => constraints = self.constraints(inner)?,
                        _ => {}
                    }
                }
                Ok(BqlFn::ProbDensity {
                    targets,
                    constraints,
                })
            }
            Rule::probof_fn => Ok(BqlFn::ProbEstimate(self.arith_of(pair)?)),
            Rule::similarity_fn => {
                let (mut of, mut to, mut context) = (None, None, Vec::new());
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::sim_of => of = Some(self.arith_of(inner)?),
                        Rule::sim_to => to = Some(self.arith_of(inner)?),
                        Rule::in_context => context = self.name_operands(inner)?,
                        _ => {}
                    }
                }
                Ok(BqlFn::Similarity { of, to, context })
            }
            Rule::predrel_fn => {
                let (mut of, mut existing, mut hypotheticals, mut context) =
                    (None, None, Vec::new(), Vec::new());
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::rel_of => of = Some(self.arith_of(inner)?),
                        Rule::rel_existing => existing = Some(self.arith_of(inner)?),
                        Rule::rel_hypothetical => {
                            for row in inner.into_inner().filter(|p| p.as_rule() == Rule::hyp_row) {
                                hypotheticals.push(self.constraints(row)?);
                            }
                        }
                        Rule::in_context => context = self.name_operands(inner)?,
                        _ => {}
                    }
                }
                if context.len() != 1 {
                    return Err(self.error(
                        &outer,
                        "predictive relevance needs exactly one context variable",
                    ));
                }
                Ok(BqlFn::PredRelevance {
                    of,
                    existing,
                    hypotheticals,
                    context: context.remove(0),
                })
            }
            Rule::depprob_fn | Rule::correl_fn => {
                let (mut of, mut with) = (None, None);
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::of_column => of = Some(self.first_name(inner)?),
                        Rule::with_column => with = Some(self.first_name(inner)?),
                        _ => {}
                    }
                }
                Ok(if rule == Rule::depprob_fn {
                    BqlFn::DepProb { of, with }
                } else {
                    BqlFn::Correlation { of, with }
                })
            }
            Rule::mutinf_fn => {
                let (mut of, mut with, mut constraints, mut nsamples) = (None, None, Vec::new(), None);
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::mi_of => of = Some(self.column_operand(self.only_inner_after_keywords(inner)?)?),
                        Rule::mi_with => {
                            with = Some(self.column_operand(self.only_inner_after_keywords(inner)?)?)
                        }
                        Rule::given_list => constraints = self.constraints(inner)?,
                        Rule::samples_clause => nsamples = Some(self.arith_of(inner)?),
                        _ => {}
                    }
                }
                Ok(BqlFn::MutInf {
                    of,
                    with,
                    constraints,
                    nsamples,
                })
            }
            Rule::predict_fn => {
                let (mut column, mut confidence, mut nsamples) = (String::new(), None, None);
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::name => column = self.name(inner)?,
                        Rule::confidence_clause => confidence = Some(self.arith_of(inner)?),
                        Rule::samples_clause => nsamples = Some(self.arith_of(inner)?),
                        _ => {}
                    }
                }
                Ok(BqlFn::Predict {
                    column,
                    confidence,
                    nsamples,
                })
            }
            _ => Err(self.error(&outer, format!("unexpected {}", rule_label(&rule)))),
        }
    }

    /// The first non-keyword pair inside `pair`.
    fn only_inner_after_keywords<'i>(&self, pair: Pair<'i, Rule>) -> Built<Pair<'i, Rule>> {
        let outer = pair.clone();
        pair.into_inner()
            .find(|p| !format!("{:?}", p.as_rule()).starts_with("kw_"))
            .ok_or_else(|| self.error(&outer, "expected an operand"))
    }

    // ----------------------------------------------------------- queries

    fn query(&self, pair: Pair<'_, Rule>) -> Built<Query> {
        match pair.as_rule() {
            Rule::select => self.select(pair).map(Query::Select),
            Rule::estimate => self.estimate(pair),
            Rule::infer => {
                let outer = pair.clone();
                let body = pair
                    .into_inner()
                    .find(|p| matches!(p.as_rule(), Rule::infer_auto | Rule::infer_explicit))
                    .ok_or_else(|| self.error(&outer, "expected INFER columns"))?;
                if body.as_rule() == Rule::infer_auto {
                    self.infer_auto(body)
                } else {
                    self.infer_explicit(body)
                }
            }
            Rule::simulate => {
                let outer = pair.clone();
                let body = pair
                    .into_inner()
                    .find(|p| matches!(p.as_rule(), Rule::simulate_models | Rule::simulate_rows))
                    .ok_or_else(|| self.error(&outer, "expected SIMULATE columns"))?;
                self.simulate(body)
            }
            _ => Err(self.error(&pair, "expected a query")),
        }
    }

    fn clause(&self, clauses: &mut Clauses, pair: Pair<'_, Rule>) -> Built<()> {
        match pair.as_rule() {
            Rule::name => clauses.population = Some(self.name(pair)?),
            Rule::model_selection => {
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::modeled_by => clauses.models.generator = Some(self.first_name(inner)?),
                        Rule::using_models => {
                            let ranges = inner
                                .into_inner()
                                .find(|p| p.as_rule() == Rule::model_ranges);
                            if let Some(ranges) = ranges {
                                clauses.models.modelnos = Some(self.model_ranges(ranges)?);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Rule::modeled_by => clauses.models.generator = Some(self.first_name(pair)?),
            Rule::column_subset => {
                let outer = pair.clone();
                let subset = pair
                    .into_inner()
                    .find(|p| matches!(p.as_rule(), Rule::paren_query | Rule::name_list))
                    .ok_or_else(|| self.error(&outer, "expected columns"))?;
                clauses.subset = Some(match subset.as_rule() {
                    Rule::name_list => ColumnSubset::Names(self.names(subset)?),
                    _ => {
                        let query = self.only_inner(subset)?;
                        ColumnSubset::Query(Box::new(self.query(query)?))
                    }
                });
            }
            Rule::where_clause => clauses.condition = Some(self.arith_of(pair)?),
            Rule::group_clause => {
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::expression_list => clauses.group_by = Some(self.expressions(inner)?),
                        Rule::having_clause => clauses.having = Some(self.arith_of(inner)?),
                        _ => {}
                    }
                }
            }
            Rule::order_clause => {
                let mut items = Vec::new();
                for item in pair.into_inner().filter(|p| p.as_rule() == Rule::order_item) {
                    let mut expr = None;
                    let mut descending = false;
                    for inner in item.into_inner() {
                        match inner.as_rule() {
                            Rule::expression => expr = Some(self.expression(inner)?),
                            Rule::kw_desc => descending = true,
                            _ => {}
                        }
                    }
                    if let Some(expr) = expr {
                        items.push(OrderItem { expr, descending });
                    }
                }
                clauses.order_by = Some(items);
            }
            Rule::limit_clause => {
                let mut first = None;
                let mut offset = None;
                let mut comma = None;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::expression => first = Some(self.expression(inner)?),
                        Rule::limit_offset => offset = Some(self.arith_of(inner)?),
                        Rule::limit_comma => comma = Some(self.arith_of(inner)?),
                        _ => {}
                    }
                }
                clauses.limit = match (first, comma) {
                    // LIMIT a, b is LIMIT b OFFSET a.
                    (Some(skip), Some(limit)) => Some(Limit {
                        limit,
                        offset: Some(skip),
                    }),
                    (Some(limit), None) => Some(Limit { limit, offset }),
                    (None, _) => None,
                };
            }
            _ => {}
        }
        Ok(())
    }

    fn model_ranges(&self, pair: Pair<'_, Rule>) -> Built<Vec<u32>> {
        let mut modelnos = RoaringBitmap::new();
        for range in pair.into_inner().filter(|p| p.as_rule() == Rule::model_range) {
            let bounds = range
                .clone()
                .into_inner()
                .map(|n| {
                    let v = self.integer(&n)?;
                    u32::try_from(v).map_err(|_| self.error(&n, format!("model number {v} out of range")))
                })
                .collect::<Built<Vec<u32>>>()?;
            match bounds.as_slice() {
                [n] => {
                    modelnos.insert(*n);
                }
                [lo, hi] if lo <= hi => {
                    modelnos.insert_range(*lo..=*hi);
                }
                [lo, hi] => {
                    return Err(self.error(&range, format!("empty model range {lo}-{hi}")));
                }
                _ => return Err(self.error(&range, "malformed model range")),
            };
        }
        Ok(modelnos.iter().collect())
    }

    fn population(&self, outer: &Pair<'_, Rule>, clauses: &mut Clauses) -> Built<String> {
        clauses
            .population
            .take()
            .ok_or_else(|| self.error(outer, "expected a population name"))
    }

    fn select_columns(&self, pair: Pair<'_, Rule>) -> Built<Vec<SelectColumn>> {
        pair.into_inner()
            .filter(|p| p.as_rule() == Rule::select_column)
            .map(|p| self.select_column(p))
            .collect()
    }

    fn select_column(&self, pair: Pair<'_, Rule>) -> Built<SelectColumn> {
        let column = self.only_inner(pair)?;
        match column.as_rule() {
            Rule::star => Ok(SelectColumn::Star),
            Rule::qualified_star => Ok(SelectColumn::QualifiedStar(self.first_name(column)?)),
            _ => {
                let mut expr = None;
                let mut name = None;
                for inner in column.clone().into_inner() {
                    match inner.as_rule() {
                        Rule::expression => expr = Some(self.expression(inner)?),
                        Rule::alias => name = Some(self.first_name(inner)?),
                        _ => {}
                    }
                }
                let expr = expr.ok_or_else(|| self.error(&column, "expected an expression"))?;
                Ok(SelectColumn::Exp { expr, name })
            }
        }
    }

    fn select(&self, pair: Pair<'_, Rule>) -> Built<Select> {
        let mut distinct = false;
        let mut columns = Vec::new();
        let mut from = None;
        let mut clauses = Clauses::default();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::quantifier => distinct = inner.into_inner().any(|q| q.as_rule() == Rule::kw_distinct),
                Rule::select_columns => columns = self.select_columns(inner)?,
                Rule::from_clause => {
                    let mut items = Vec::new();
                    for item in inner.into_inner().filter(|p| p.as_rule() == Rule::from_item) {
                        items.push(self.from_item(item)?);
                    }
                    from = Some(items);
                }
                _ => self.clause(&mut clauses, inner)?,
            }
        }
        Ok(Select {
            distinct,
            columns,
            from,
            condition: clauses.condition,
            group_by: clauses.group_by,
            having: clauses.having,
            order_by: clauses.order_by,
            limit: clauses.limit,
        })
    }

    fn from_item(&self, pair: Pair<'_, Rule>) -> Built<FromItem> {
        let mut item = None;
        let mut alias = None;
        for inner in pair.clone().into_inner() {
            match inner.as_rule() {
                Rule::name => item = Some(FromItem::Table { name: self.name(inner)?, alias: None }),
                Rule::paren_query => {
                    let query = self.only_inner(inner)?;
                    item = Some(FromItem::Subquery {
                        query: Box::new(self.query(query)?),
                        alias: None,
                    });
                }
                Rule::alias => alias = Some(self.first_name(inner)?),
                _ => {}
            }
        }
        match item {
            Some(FromItem::Table { name, .. }) => Ok(FromItem::Table { name, alias }),
            Some(FromItem::Subquery { query, .. }) => Ok(FromItem::Subquery { query, alias }),
            None => Err(self.error(&pair, "expected a table or subquery")),
        }
    }

    fn estimate(&self, pair: Pair<'_, Rule>) -> Built<Query> {
        let outer = pair.clone();
        let mut distinct = false;
        let mut columns = Vec::new();
        let mut source = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::quantifier => distinct = inner.into_inner().any(|q| q.as_rule() == Rule::kw_distinct),
                Rule::select_columns => columns = self.select_columns(inner)?,
                Rule::est_by
                | Rule::est_rows
                | Rule::est_columns
                | Rule::est_pairwise_columns
                | Rule::est_pairwise_rows => source = Some(inner),
                _ => {}
            }
        }
        let source = source.ok_or_else(|| self.error(&outer, "expected BY or FROM"))?;
        let rule = source.as_rule();
        let mut clauses = Clauses::default();
        for inner in source.clone().into_inner() {
            self.clause(&mut clauses, inner)?;
        }
        let population = self.population(&source, &mut clauses)?;
        Ok(match rule {
            Rule::est_by => Query::EstimateBy(EstimateBy {
                distinct,
                columns,
                population,
                models: clauses.models,
            }),
            Rule::est_rows => Query::Estimate(Estimate {
                distinct,
                columns,
                population,
                models: clauses.models,
                condition: clauses.condition,
                group_by: clauses.group_by,
                having: clauses.having,
                order_by: clauses.order_by,
                limit: clauses.limit,
            }),
            Rule::est_columns => Query::EstimateColumns(EstimateColumns {
                columns,
                population,
                models: clauses.models,
                subset: clauses.subset,
                condition: clauses.condition,
                order_by: clauses.order_by,
                limit: clauses.limit,
            }),
            Rule::est_pairwise_columns => Query::EstimatePairwiseColumns(EstimatePairwiseColumns {
                columns,
                population,
                models: clauses.models,
                subset: clauses.subset,
                condition: clauses.condition,
                order_by: clauses.order_by,
                limit: clauses.limit,
            }),
            _ => Query::EstimatePairwiseRows(EstimatePairwiseRows {
                columns,
                population,
                models: clauses.models,
                condition: clauses.condition,
                order_by: clauses.order_by,
                limit: clauses.limit,
            }),
        })
    }

    fn infer_auto(&self, pair: Pair<'_, Rule>) -> Built<Query> {
        let outer = pair.clone();
        let mut columns = Vec::new();
        let mut confidence = None;
        let mut nsamples = None;
        let mut clauses = Clauses::default();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::select_columns => columns = self.select_columns(inner)?,
                Rule::confidence_clause => confidence = Some(self.arith_of(inner)?),
                Rule::samples_clause => nsamples = Some(self.arith_of(inner)?),
                _ => self.clause(&mut clauses, inner)?,
            }
        }
        let population = self.population(&outer, &mut clauses)?;
        Ok(Query::InferAuto(InferAuto {
            columns,
            confidence,
            nsamples,
            population,
            models: clauses.models,
            condition: clauses.condition,
            group_by: clauses.group_by,
            having: clauses.having,
            order_by: clauses.order_by,
            limit: clauses.limit,
        }))
    }

    fn infer_explicit(&self, pair: Pair<'_, Rule>) -> Built<Query> {
        let outer = pair.clone();
        let mut columns = Vec::new();
        let mut clauses = Clauses::default();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::select_column => columns.push(InferColumn::Select(self.select_column(inner)?)),
                Rule::predict_column => columns.push(self.predict_column(inner)?),
                _ => self.clause(&mut clauses, inner)?,
            }
        }
        let population = self.population(&outer, &mut clauses)?;
        Ok(Query::InferExplicit(InferExplicit {
            columns,
            population,
            models: clauses.models,
            condition: clauses.condition,
            group_by: clauses.group_by,
            having: clauses.having,
            order_by: clauses.order_by,
            limit: clauses.limit,
        }))
    }

    fn predict_column(&self, pair: Pair<'_, Rule>) -> Built<InferColumn> {
        let outer = pair.clone();
        let mut names = Vec::new();
        let mut aliased = false;
        let mut nsamples = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::name => names.push(self.name(inner)?),
                Rule::kw_as => aliased = true,
                Rule::samples_clause => nsamples = Some(self.arith_of(inner)?),
                _ => {}
            }
        }
        let mut names = names.into_iter();
        let (Some(variable), Some(second)) = (names.next(), names.next()) else {
            return Err(self.error(&outer, "expected PREDICT variable and CONFIDENCE name"));
        };
        let (name, confidence_name) = if aliased {
            let confidence = names
                .next()
                .ok_or_else(|| self.error(&outer, "expected CONFIDENCE name"))?;
            (Some(second), confidence)
        } else {
            (None, second)
        };
        Ok(InferColumn::Predict {
            variable,
            name,
            confidence_name,
            nsamples,
        })
    }

    fn simulate(&self, pair: Pair<'_, Rule>) -> Built<Query> {
        let outer = pair.clone();
        let models_form = pair.as_rule() == Rule::simulate_models;
        let mut names = Vec::new();
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        let mut limit = None;
        let mut accuracy = None;
        let mut clauses = Clauses::default();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::select_columns => columns = self.select_columns(inner)?,
                Rule::name_list => names = self.names(inner)?,
                Rule::sim_given => constraints = self.constraints(inner)?,
                Rule::expression => limit = Some(self.expression(inner)?),
                Rule::sim_accuracy => {
                    let n = self.find_integer(inner.clone())?;
                    accuracy = Some(
                        u32::try_from(n)
                            .map_err(|_| self.error(&inner, format!("accuracy {n} out of range")))?,
                    );
                }
                _ => self.clause(&mut clauses, inner)?,
            }
        }
        let population = self.population(&outer, &mut clauses)?;
        if models_form {
            return Ok(Query::SimulateModelsExp(SimulateModels {
                columns,
                population,
                generator: clauses.models.generator,
            }));
        }
        Ok(Query::Simulate(Simulate {
            columns: names,
            population,
            models: clauses.models,
            constraints,
            limit: limit.ok_or_else(|| self.error(&outer, "SIMULATE needs a LIMIT"))?,
            accuracy,
        }))
    }

    // ---------------------------------------------------------- commands

    fn command(&self, pair: Pair<'_, Rule>) -> Built<Command> {
        let outer = pair.clone();
        let rule = pair.as_rule();
        let has = |r: Rule| outer.clone().into_inner().any(|p| p.as_rule() == r);
        let if_not_exists = has(Rule::if_not_exists);
        let if_exists = has(Rule::if_exists);
        let names = || -> Built<Vec<String>> {
            outer
                .clone()
                .into_inner()
                .filter(|p| p.as_rule() == Rule::name)
                .map(|p| self.name(p))
                .collect()
        };
        let nth_name = |n: usize| -> Built<String> {
            names()?
                .into_iter()
                .nth(n)
                .ok_or_else(|| self.error(&outer, "expected a name"))
        };
        match rule {
            Rule::cmd_begin => Ok(Command::Begin),
            Rule::cmd_commit => Ok(Command::Commit),
            Rule::cmd_rollback => Ok(Command::Rollback),
            Rule::cmd_create_table => {
                let query = pair
                    .into_inner()
                    .find(|p| is_query_rule(p.as_rule()))
                    .ok_or_else(|| self.error(&outer, "expected a query"))?;
                Ok(Command::CreateTableAs {
                    temp: has(Rule::kw_temp),
                    if_not_exists,
                    name: nth_name(0)?,
                    query: Box::new(self.query(query)?),
                })
            }
            Rule::cmd_drop_table => Ok(Command::DropTable {
                if_exists,
                name: nth_name(0)?,
            }),
            Rule::cmd_create_population => {
                let mut schema = Vec::new();
                if let Some(clauses) = pair.into_inner().find(|p| p.as_rule() == Rule::pop_schema) {
                    for clause in clauses.into_inner() {
                        schema.push(self.population_clause(clause)?);
                    }
                }
                Ok(Command::CreatePopulation {
                    if_not_exists,
                    name: nth_name(0)?,
                    table: nth_name(1)?,
                    schema,
                })
            }
            Rule::cmd_drop_population => Ok(Command::DropPopulation {
                if_exists,
                name: nth_name(0)?,
            }),
            Rule::cmd_alter_population => {
                let mut commands = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::alter_add_variable => {
                            let mut name = String::new();
                            let mut stattype = None;
                            for part in inner.into_inner() {
                                match part.as_rule() {
                                    Rule::name => name = self.name(part)?,
                                    Rule::stattype => stattype = Some(self.first_name(part)?.to_lowercase()),
                                    _ => {}
                                }
                            }
                            commands.push(AlterPopulation::AddVariable { name, stattype });
                        }
                        Rule::alter_set_stattype => {
                            let mut columns = Vec::new();
                            let mut stattype = String::new();
                            for part in inner.into_inner() {
                                match part.as_rule() {
                                    Rule::name_list => columns = self.names(part)?,
                                    Rule::stattype => stattype = self.first_name(part)?.to_lowercase(),
                                    _ => {}
                                }
                            }
                            commands.push(AlterPopulation::SetStattype { columns, stattype });
                        }
                        _ => {}
                    }
                }
                Ok(Command::AlterPopulation {
                    population: nth_name(0)?,
                    commands,
                })
            }
            Rule::cmd_create_generator => {
                let mut backend = None;
                let mut schema = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::using_backend => backend = Some(self.first_name(inner)?),
                        Rule::schema_group => schema = self.schema_items(inner)?,
                        _ => {}
                    }
                }
                Ok(Command::CreateGenerator {
                    if_not_exists,
                    name: nth_name(0)?,
                    population: nth_name(1)?,
                    backend,
                    schema,
                })
            }
            Rule::cmd_drop_generator => Ok(Command::DropGenerator {
                if_exists,
                name: nth_name(0)?,
            }),
            Rule::cmd_alter_generator => {
                let mut commands = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::alter_rename => commands.push(AlterGenerator::RenameTo(self.first_name(inner)?)),
                        Rule::alter_backend => commands.push(AlterGenerator::Backend(self.schema_items(inner)?)),
                        _ => {}
                    }
                }
                Ok(Command::AlterGenerator {
                    generator: nth_name(0)?,
                    commands,
                })
            }
            Rule::cmd_initialize_models => {
                let n = self.find_integer(pair)?;
                let count = u32::try_from(n)
                    .map_err(|_| self.error(&outer, format!("model count {n} out of range")))?;
                Ok(Command::InitializeModels {
                    count,
                    if_not_exists,
                    generator: nth_name(0)?,
                })
            }
            Rule::cmd_analyze_models => {
                let mut analysis = AnalyzeModels {
                    generator: nth_name(0)?,
                    modelnos: None,
                    iterations: None,
                    seconds: None,
                    checkpoint_iterations: None,
                    checkpoint_seconds: None,
                    wait: false,
                    program: None,
                };
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::model_ranges => analysis.modelnos = Some(self.model_ranges(inner)?),
                        Rule::analysis_budget => {
                            let (iterations, seconds) = self.budget(inner)?;
                            analysis.iterations = iterations;
                            analysis.seconds = seconds;
                        }
                        Rule::analysis_checkpoint => {
                            let (iterations, seconds) = self.budget(inner)?;
                            analysis.checkpoint_iterations = iterations;
                            analysis.checkpoint_seconds = seconds;
                        }
                        Rule::kw_wait => analysis.wait = true,
                        Rule::schema_group => analysis.program = Some(self.schema_items(inner)?),
                        _ => {}
                    }
                }
                Ok(Command::AnalyzeModels(analysis))
            }
            Rule::cmd_drop_models => {
                let mut modelnos = None;
                if let Some(ranges) = pair.into_inner().find(|p| p.as_rule() == Rule::model_ranges) {
                    modelnos = Some(self.model_ranges(ranges)?);
                }
                Ok(Command::DropModels {
                    modelnos,
                    generator: nth_name(0)?,
                })
            }
            _ => Err(self.error(&outer, format!("unexpected {}", rule_label(&rule)))),
        }
    }

    /// `n ITERATIONS|SECONDS|MINUTES` as (iterations, seconds).
    fn budget(&self, pair: Pair<'_, Rule>) -> Built<(Option<u64>, Option<u64>)> {
        let mut amount = 0u64;
        let mut unit = Rule::kw_iterations;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::integer => amount = self.count(&inner)?,
                Rule::time_unit => {
                    if let Some(kw) = inner.into_inner().next() {
                        unit = kw.as_rule();
                    }
                }
                _ => {}
            }
        }
        Ok(match unit {
            Rule::kw_seconds => (None, Some(amount)),
            Rule::kw_minutes => (None, Some(amount.saturating_mul(60))),
            _ => (Some(amount), None),
        })
    }

    fn population_clause(&self, pair: Pair<'_, Rule>) -> Built<PopulationClause> {
        let outer = pair.clone();
        match pair.as_rule() {
            Rule::pop_model | Rule::pop_variable => {
                let mut columns = Vec::new();
                let mut stattype = String::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::name => columns.push(self.name(inner)?),
                        Rule::name_list => columns = self.names(inner)?,
                        Rule::stattype => stattype = self.first_name(inner)?.to_lowercase(),
                        _ => {}
                    }
                }
                Ok(PopulationClause::Model { columns, stattype })
            }
            Rule::pop_ignore => Ok(PopulationClause::Ignore(self.name_operands(pair)?)),
            Rule::pop_guess => {
                let everything = pair.clone().into_inner().any(|p| p.as_rule() == Rule::star);
                if everything {
                    Ok(PopulationClause::Guess(None))
                } else {
                    Ok(PopulationClause::Guess(Some(self.name_operands(pair)?)))
                }
            }
            _ => Err(self.error(&outer, "unexpected population clause")),
        }
    }

    fn schema_items(&self, pair: Pair<'_, Rule>) -> Built<Vec<SchemaToken>> {
        let mut tokens = Vec::new();
        for inner in pair.into_inner() {
            tokens.push(match inner.as_rule() {
                Rule::schema_group => SchemaToken::Group(self.schema_items(inner)?),
                Rule::string => SchemaToken::Str(unquote(inner.as_str(), '\'')),
                Rule::float | Rule::integer => {
                    let value = match parse_integer(inner.as_str()) {
                        Some(n) => n as f64,
                        None => inner
                            .as_str()
                            .parse::<f64>()
                            .map_err(|_| self.error(&inner, "malformed number"))?,
                    };
                    SchemaToken::Number(value)
                }
                Rule::schema_word => match inner.clone().into_inner().next() {
                    Some(word) if word.as_rule() == Rule::quoted_ident => {
                        SchemaToken::Word(unquote(word.as_str(), '"'))
                    }
                    _ => SchemaToken::Word(inner.as_str().to_string()),
                },
                _ => SchemaToken::Punct(inner.as_str().to_string()),
            });
        }
        Ok(tokens)
    }
}

fn is_query_rule(rule: Rule) -> bool {
    matches!(rule, Rule::select | Rule::estimate | Rule::infer | Rule::simulate)
}

fn unquote(text: &str, quote: char) -> String {
    let inner = text
        .strip_prefix(quote)
        .and_then(|t| t.strip_suffix(quote))
        .unwrap_or(text);
    let doubled: String = [quote, quote].iter().collect();
    inner.replace(&doubled, &quote.to_string())
}

fn parse_integer(text: &str) -> Option<i64> {
    match text.get(..2) {
        Some("0x") | Some("0X") => i64::from_str_radix(&text[2..], 16).ok(),
        _ => text.parse::<i64>().ok(),
    }
}
