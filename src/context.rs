//! Arity-checked compiler contexts.
//!
//! Each query shape leaves some row and column positions free: a row-sourced
//! ESTIMATE supplies the current row, a pairwise-columns ESTIMATE supplies two
//! column numbers, and so on. A primitive consumes a fixed number of rows or
//! columns; whatever the query does not supply implicitly must be given
//! explicitly, and nothing more.

use crate::error::{BqlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Plain SQL: no probabilistic primitives at all.
    None,
    /// ESTIMATE ... BY p and SIMULATE ... FROM MODELS OF p.
    Constant,
    /// ESTIMATE/INFER ... FROM p.
    OneRow,
    /// ESTIMATE ... FROM PAIRWISE p.
    TwoRow,
    /// ESTIMATE ... FROM VARIABLES OF p.
    OneColumn,
    /// ESTIMATE ... FROM PAIRWISE VARIABLES OF p.
    TwoColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Rows,
    Columns,
}

impl Dimension {
    fn noun(self, n: usize) -> &'static str {
        match (self, n) {
            (Dimension::Rows, 1) => "row",
            (Dimension::Rows, _) => "rows",
            (Dimension::Columns, 1) => "column",
            (Dimension::Columns, _) => "columns",
        }
    }
}

fn count_word(n: usize) -> String {
    match n {
        1 => "one".to_string(),
        2 => "two".to_string(),
        n => n.to_string(),
    }
}

impl Arity {
    pub fn free_rows(self) -> usize {
        match self {
            Arity::OneRow => 1,
            Arity::TwoRow => 2,
            _ => 0,
        }
    }

    pub fn free_columns(self) -> usize {
        match self {
            Arity::OneColumn => 1,
            Arity::TwoColumn => 2,
            _ => 0,
        }
    }

    pub fn free(self, dimension: Dimension) -> usize {
        match dimension {
            Dimension::Rows => self.free_rows(),
            Dimension::Columns => self.free_columns(),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Arity::None => "plain SQL",
            Arity::Constant => "a constant context",
            Arity::OneRow => "a one-row context",
            Arity::TwoRow => "a pairwise-row context",
            Arity::OneColumn => "a one-column context",
            Arity::TwoColumn => "a pairwise-column context",
        }
    }

    /// Checks that `explicit` operands plus this context's free positions
    /// make exactly `needed`, returning the number of implicit positions.
    pub fn check(self, what: &str, dimension: Dimension, needed: usize, explicit: usize) -> Result<usize> {
        if self == Arity::None {
            return Err(BqlError::compile(format!(
                "{what} is only allowed in BQL queries, not in {}",
                self.describe()
            )));
        }
        let implicit = self.free(dimension);
        if explicit + implicit == needed {
            return Ok(implicit);
        }
        if implicit > needed {
            return Err(BqlError::compile(format!(
                "{what} needs exactly {} {} but {} supplies {}",
                count_word(needed),
                dimension.noun(needed),
                self.describe(),
                count_word(implicit)
            )));
        }
        let allowed = needed - implicit;
        if allowed == 0 {
            Err(BqlError::compile(format!(
                "{what} takes no explicit {} in {}",
                dimension.noun(0),
                self.describe()
            )))
        } else if explicit > allowed {
            Err(BqlError::compile(format!(
                "{what} needs at most {} explicit {} in {}",
                count_word(allowed),
                dimension.noun(allowed),
                self.describe()
            )))
        } else {
            Err(BqlError::compile(format!(
                "{what} needs exactly {} {}, got {} in {}",
                count_word(needed),
                dimension.noun(needed),
                count_word(explicit + implicit),
                self.describe()
            )))
        }
    }

    /// Primitives that consume neither rows nor columns still need a BQL
    /// query around them.
    pub fn check_bql(self, what: &str) -> Result<()> {
        if self == Arity::None {
            return Err(BqlError::compile(format!(
                "{what} is only allowed in BQL queries, not in {}",
                self.describe()
            )));
        }
        Ok(())
    }
}

/// The probabilistic environment of one BQL query: which population and
/// models it ranges over, and the SQL that names its implicit positions.
#[derive(Debug, Clone)]
pub struct Context {
    pub arity: Arity,
    pub population_id: i64,
    pub population: String,
    pub table: String,
    /// Generator as written in MODELED BY, with its id.
    pub generator_name: Option<String>,
    pub generator_id: Option<i64>,
    /// SQL for the generator argument of emitted calls.
    pub generator_sql: String,
    /// SQL for the model-number argument of emitted calls.
    pub models_sql: String,
    /// SQL for each implicit rowid, leading first.
    pub rows: Vec<String>,
    /// Qualifier for the current row's column values in a one-row context.
    pub row_qualifier: String,
    /// SQL for each implicit column number, leading first.
    pub columns: Vec<String>,
}

impl Context {
    pub fn plain() -> Context {
        Context {
            arity: Arity::None,
            population_id: 0,
            population: String::new(),
            table: String::new(),
            generator_name: None,
            generator_id: None,
            generator_sql: "NULL".to_string(),
            models_sql: "NULL".to_string(),
            rows: Vec::new(),
            row_qualifier: String::new(),
            columns: Vec::new(),
        }
    }

    /// Completes `explicit` with the implicit positions in `dimension`. The
    /// implicit ones fill the leading slots.
    pub fn fill(
        &self,
        what: &str,
        dimension: Dimension,
        needed: usize,
        explicit: Vec<String>,
    ) -> Result<Vec<String>> {
        let implicit = self.arity.check(what, dimension, needed, explicit.len())?;
        let source = match dimension {
            Dimension::Rows => &self.rows,
            Dimension::Columns => &self.columns,
        };
        if source.len() < implicit {
            return Err(BqlError::Invariant(format!(
                "{} lacks implicit {}",
                self.arity.describe(),
                dimension.noun(implicit)
            )));
        }
        let mut filled: Vec<String> = source[..implicit].to_vec();
        filled.extend(explicit);
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Arity; 5] = [
        Arity::Constant,
        Arity::OneRow,
        Arity::TwoRow,
        Arity::OneColumn,
        Arity::TwoColumn,
    ];

    #[test]
    fn two_column_primitives_follow_the_free_count() {
        for arity in ALL {
            for explicit in 0..=2 {
                let ok = arity
                    .check("correlation", Dimension::Columns, 2, explicit)
                    .is_ok();
                assert_eq!(ok, explicit + arity.free_columns() == 2, "{arity:?} {explicit}");
            }
        }
    }

    #[test]
    fn messages_name_the_requirement() {
        let err = Arity::TwoColumn
            .check("dependence probability", Dimension::Columns, 2, 1)
            .unwrap_err();
        assert!(err.to_string().contains("takes no explicit columns"));
        let err = Arity::Constant
            .check("dependence probability", Dimension::Columns, 2, 1)
            .unwrap_err();
        assert!(err.to_string().contains("needs exactly two columns"));
        let err = Arity::TwoRow
            .check("predictive probability", Dimension::Rows, 1, 0)
            .unwrap_err();
        assert!(err.to_string().contains("needs exactly one row"));
    }

    #[test]
    fn implicit_positions_lead() {
        let mut context = Context::plain();
        context.arity = Arity::OneColumn;
        context.columns = vec!["v.colno".to_string()];
        let filled = context
            .fill("dependence probability", Dimension::Columns, 2, vec!["3".to_string()])
            .unwrap();
        assert_eq!(filled, vec!["v.colno".to_string(), "3".to_string()]);
    }

    #[test]
    fn plain_sql_refuses_everything() {
        assert!(Arity::None.check_bql("similarity").is_err());
        assert!(Arity::None.check("similarity", Dimension::Rows, 2, 2).is_err());
    }
}
