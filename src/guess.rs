//! Statistical type guessing for `GUESS STATTYPES OF (...)`.
//!
//! Numeric columns with many distinct values guess as `numerical`, text
//! columns whose every value is distinct look like keys and stay unmodeled,
//! and everything else is `nominal`.

use rusqlite::Connection;
use rusqlite::types::Value;

use crate::error::Result;
use crate::output::quote_ident;

/// Outcome of guessing one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guess {
    Stattype(&'static str),
    /// Key-like: every value distinct, nothing to model.
    Ignore,
}

fn is_number(value: &Value) -> bool {
    match value {
        Value::Integer(_) | Value::Real(_) => true,
        Value::Text(text) => text.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

/// Non-null values of `column` and how many of them are distinct.
fn column_profile(connection: &Connection, table: &str, column: &str) -> Result<(Vec<Value>, usize)> {
    let table = quote_ident(table);
    let column = quote_ident(column);
    let count: i64 = connection.query_row(
        &format!("select count({column}) from {table}"),
        [],
        |r| r.get(0),
    )?;
    let mut statement = connection.prepare(&format!(
        "select distinct {column} from {table} where {column} is not null"
    ))?;
    let distinct = statement
        .query_map([], |r| r.get::<_, Value>(0))?
        .collect::<rusqlite::Result<Vec<Value>>>()?;
    Ok((distinct, count.max(0) as usize))
}

pub fn guess_stattype(connection: &Connection, table: &str, column: &str, nominal_cutoff: u32) -> Result<Guess> {
    let (distinct, count) = column_profile(connection, table, column)?;
    if distinct.is_empty() {
        return Ok(Guess::Stattype("nominal"));
    }
    if distinct.iter().all(is_number) {
        if distinct.len() > nominal_cutoff as usize {
            return Ok(Guess::Stattype("numerical"));
        }
        return Ok(Guess::Stattype("nominal"));
    }
    if distinct.len() == count {
        return Ok(Guess::Ignore);
    }
    Ok(Guess::Stattype("nominal"))
}

/// True when every non-null value of `column` reads as a number.
pub fn numeric_coercible(connection: &Connection, table: &str, column: &str) -> Result<bool> {
    let (distinct, _) = column_profile(connection, table, column)?;
    Ok(distinct.iter().all(is_number))
}
