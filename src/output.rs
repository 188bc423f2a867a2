//! Compiler output accumulator.
//!
//! An [`Output`] collects SQL text for one (sub)query together with the
//! winders and unwinders it needs. Parameter renumbering lives in [`Params`],
//! which every subquery of a phrase borrows, so a named parameter used in
//! several places is bound through one output slot.

use std::collections::{BTreeSet, HashMap};

use bimap::BiMap;
use rusqlite::types::Value;

use crate::ast::{Literal, ParsedPhrase};
use crate::error::{BqlError, Result};

/// Caller-supplied parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Bindings {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(HashMap<String, Value>),
}

impl From<Vec<Value>> for Bindings {
    fn from(values: Vec<Value>) -> Self {
        Bindings::Positional(values)
    }
}

impl From<HashMap<String, Value>> for Bindings {
    fn from(values: HashMap<String, Value>) -> Self {
        Bindings::Named(values)
    }
}

/// A standalone SQL statement with its positional bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub bindings: Vec<Value>,
}

impl BoundStatement {
    pub fn new(sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        BoundStatement {
            sql: sql.into(),
            bindings,
        }
    }
}

/// Result of compiling one query phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub winders: Vec<BoundStatement>,
    pub unwinders: Vec<BoundStatement>,
}

/// Parameter state of one phrase.
#[derive(Debug, Clone, Default)]
pub struct Params {
    n_numpar: usize,
    nampar_map: Option<BiMap<String, usize>>,
    /// Output slot `i + 1` is bound to source parameter `select[i]`.
    select: Vec<usize>,
    /// Source parameter number to output slot.
    renumber: HashMap<usize, usize>,
}

impl Params {
    pub fn new(n_numpar: usize, nampar_map: Option<BiMap<String, usize>>) -> Self {
        Params {
            n_numpar,
            nampar_map,
            select: Vec::new(),
            renumber: HashMap::new(),
        }
    }

    pub fn for_phrase(phrase: &ParsedPhrase) -> Self {
        Params::new(phrase.n_numpar(), phrase.nampar_map().cloned())
    }

    /// A fresh state over the same declared parameters.
    pub fn sibling(&self) -> Self {
        Params::new(self.n_numpar, self.nampar_map.clone())
    }

    pub fn n_numpar(&self) -> usize {
        self.n_numpar
    }

    /// Output slot for source parameter `n`, allocated on first use.
    pub fn slot(&mut self, n: usize) -> Result<usize> {
        if n == 0 || n > self.n_numpar {
            return Err(BqlError::Invariant(format!(
                "parameter {n} outside 1..={}",
                self.n_numpar
            )));
        }
        if let Some(&slot) = self.renumber.get(&n) {
            return Ok(slot);
        }
        self.select.push(n);
        let slot = self.select.len();
        self.renumber.insert(n, slot);
        Ok(slot)
    }

    /// Source numbers in output-slot order.
    pub fn selected(&self) -> &[usize] {
        &self.select
    }

    /// Values for the output slots, drawn from the caller's bindings.
    pub fn bindings(&self, input: &Bindings) -> Result<Vec<Value>> {
        let by_number = self.resolve(input)?;
        Ok(self
            .select
            .iter()
            .map(|n| by_number.get(n).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Maps every declared parameter number to its caller value.
    fn resolve(&self, input: &Bindings) -> Result<HashMap<usize, Value>> {
        match input {
            Bindings::None if self.n_numpar == 0 => Ok(HashMap::new()),
            Bindings::None => Err(BqlError::Bind(format!(
                "phrase has {} parameters but no bindings were given",
                self.n_numpar
            ))),
            Bindings::Positional(values) => {
                if values.len() != self.n_numpar {
                    return Err(BqlError::Bind(format!(
                        "phrase has {} parameters, {} bindings were given",
                        self.n_numpar,
                        values.len()
                    )));
                }
                Ok(values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i + 1, v.clone()))
                    .collect())
            }
            Bindings::Named(values) => {
                let empty = BiMap::new();
                let names = self.nampar_map.as_ref().unwrap_or(&empty);
                let mut resolved = HashMap::new();
                for (key, value) in values {
                    let n = lookup_name(names, key)?;
                    if resolved.insert(n, value.clone()).is_some() {
                        return Err(BqlError::Bind(format!(
                            "parameter {key} bound more than once"
                        )));
                    }
                }
                let missing: BTreeSet<usize> =
                    (1..=self.n_numpar).filter(|n| !resolved.contains_key(n)).collect();
                if let Some(n) = missing.first() {
                    let label = names
                        .get_by_right(n)
                        .cloned()
                        .unwrap_or_else(|| format!("?{n}"));
                    return Err(BqlError::Bind(format!("missing binding for {label}")));
                }
                Ok(resolved)
            }
        }
    }
}

/// Finds the number of a named parameter. A key without its sigil matches
/// when exactly one spelling of it is declared.
fn lookup_name(names: &BiMap<String, usize>, key: &str) -> Result<usize> {
    if let Some(&n) = names.get_by_left(key) {
        return Ok(n);
    }
    let candidates: Vec<usize> = [":", "@", "$"]
        .iter()
        .filter_map(|sigil| names.get_by_left(&format!("{sigil}{key}")).copied())
        .collect();
    match candidates.as_slice() {
        [n] => Ok(*n),
        [] => Err(BqlError::Bind(format!("unknown parameter name {key}"))),
        _ => Err(BqlError::Bind(format!("ambiguous parameter name {key}"))),
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn render_float(v: f64) -> String {
    if v.is_nan() {
        "NULL".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "9e999" } else { "-9e999" }.to_string()
    } else {
        format!("{v:?}")
    }
}

pub fn render_literal(literal: &Literal) -> String {
    match literal {
        Literal::Null => "NULL".to_string(),
        Literal::Integer(n) => n.to_string(),
        Literal::Float(v) => render_float(*v),
        Literal::String(s) => quote_string(s),
        Literal::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("x'{hex}'")
        }
    }
}

pub struct Output<'p> {
    params: &'p mut Params,
    input: &'p Bindings,
    text: String,
    winders: Vec<BoundStatement>,
    unwinders: Vec<BoundStatement>,
}

impl<'p> Output<'p> {
    pub fn new(params: &'p mut Params, input: &'p Bindings) -> Self {
        Output {
            params,
            input,
            text: String::new(),
            winders: Vec::new(),
            unwinders: Vec::new(),
        }
    }

    /// Runs `f` against a child accumulator that shares this one's parameter
    /// state and owns its own text. The child's winders and unwinders are
    /// lifted into ours; its text is returned.
    pub fn nested<R>(
        &mut self,
        f: impl FnOnce(&mut Output<'_>) -> Result<R>,
    ) -> Result<(String, R)> {
        let mut child = Output {
            params: &mut *self.params,
            input: self.input,
            text: String::new(),
            winders: Vec::new(),
            unwinders: Vec::new(),
        };
        let result = f(&mut child)?;
        let Output {
            text,
            winders,
            unwinders,
            ..
        } = child;
        self.winders.extend(winders);
        self.unwinders.extend(unwinders);
        Ok((text, result))
    }

    /// Like [`Output::nested`], appending the child's text in place.
    pub fn write_nested(&mut self, f: impl FnOnce(&mut Output<'_>) -> Result<()>) -> Result<()> {
        let (text, ()) = self.nested(f)?;
        self.text.push_str(&text);
        Ok(())
    }

    pub fn write(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn write_ident(&mut self, name: &str) {
        self.text.push_str(&quote_ident(name));
    }

    pub fn write_literal(&mut self, literal: &Literal) {
        self.text.push_str(&render_literal(literal));
    }

    pub fn write_param(&mut self, n: usize) -> Result<()> {
        let slot = self.params.slot(n)?;
        self.text.push_str(&format!("?{slot}"));
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn input(&self) -> &Bindings {
        self.input
    }

    pub fn params(&self) -> &Params {
        &*self.params
    }

    pub fn winders(&self) -> &[BoundStatement] {
        &self.winders
    }

    pub fn push_winder(&mut self, statement: BoundStatement) {
        self.winders.push(statement);
    }

    pub fn push_unwinder(&mut self, statement: BoundStatement) {
        self.unwinders.push(statement);
    }

    pub fn finish(self) -> Result<Compiled> {
        let bindings = self.params.bindings(self.input)?;
        Ok(Compiled {
            sql: self.text,
            bindings,
            winders: self.winders,
            unwinders: self.unwinders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(map: &[(&str, usize)]) -> BiMap<String, usize> {
        map.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn repeated_parameters_share_a_slot() {
        let mut params = Params::new(3, None);
        assert_eq!(params.slot(3).unwrap(), 1);
        assert_eq!(params.slot(1).unwrap(), 2);
        assert_eq!(params.slot(3).unwrap(), 1);
        assert_eq!(params.selected(), &[3, 1]);
        let values = params
            .bindings(&Bindings::Positional(vec![
                Value::Integer(10),
                Value::Integer(20),
                Value::Integer(30),
            ]))
            .unwrap();
        assert_eq!(values, vec![Value::Integer(30), Value::Integer(10)]);
    }

    #[test]
    fn positional_count_must_match() {
        let params = Params::new(2, None);
        let err = params
            .bindings(&Bindings::Positional(vec![Value::Integer(1)]))
            .unwrap_err();
        assert!(matches!(err, BqlError::Bind(_)));
    }

    #[test]
    fn named_bindings_are_strict() {
        let mut params = Params::new(2, Some(named(&[(":a", 1), ("$b", 2)])));
        params.slot(2).unwrap();
        params.slot(1).unwrap();

        let full: HashMap<String, Value> = [
            ("a".to_string(), Value::Integer(1)),
            ("$b".to_string(), Value::Integer(2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            params.bindings(&Bindings::Named(full.clone())).unwrap(),
            vec![Value::Integer(2), Value::Integer(1)]
        );

        let mut missing = full.clone();
        missing.remove("a");
        assert!(params.bindings(&Bindings::Named(missing)).is_err());

        let mut extra = full;
        extra.insert("c".to_string(), Value::Null);
        assert!(params.bindings(&Bindings::Named(extra)).is_err());
    }

    #[test]
    fn literals_render_as_sql() {
        assert_eq!(render_literal(&Literal::Float(1.0)), "1.0");
        assert_eq!(render_literal(&Literal::String("it's".into())), "'it''s'");
        assert_eq!(render_literal(&Literal::Blob(vec![0xab, 0x01])), "x'AB01'");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
