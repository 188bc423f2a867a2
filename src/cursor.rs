//! Result cursors and the unwind guard.

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use tracing::{trace, warn};

use crate::output::BoundStatement;

/// Runs a statement list in reverse order, exactly once: on [`Unwind::run`]
/// or when dropped, whichever comes first.
pub struct Unwind<'c> {
    connection: &'c Connection,
    statements: Vec<BoundStatement>,
    done: bool,
}

impl<'c> Unwind<'c> {
    pub fn new(connection: &'c Connection, statements: Vec<BoundStatement>) -> Self {
        Unwind {
            connection,
            statements,
            done: false,
        }
    }

    /// Failures are logged and skipped; every statement gets its chance.
    pub fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for statement in self.statements.iter().rev() {
            match self
                .connection
                .execute(&statement.sql, params_from_iter(statement.bindings.iter()))
            {
                Ok(_) => trace!(sql = %statement.sql, "unwound"),
                Err(e) => warn!(error = %e, sql = %statement.sql, "unwinder failed"),
            }
        }
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        self.run();
    }
}

/// Buffered rows of one executed phrase. Commands yield an empty cursor.
pub struct Cursor<'c> {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
    unwind: Unwind<'c>,
}

impl<'c> Cursor<'c> {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>, unwind: Unwind<'c>) -> Self {
        Cursor {
            columns,
            rows: rows.into_iter(),
            unwind,
        }
    }

    pub fn empty(connection: &'c Connection) -> Self {
        Cursor::new(Vec::new(), Vec::new(), Unwind::new(connection, Vec::new()))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet pulled.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Abandons the remaining rows and unwinds now.
    pub fn close(mut self) {
        self.unwind.run();
    }
}

impl Iterator for Cursor<'_> {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Vec<Value>> {
        let row = self.rows.next();
        if row.is_none() {
            self.unwind.run();
        }
        row
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_table() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        connection.execute_batch("create table log (n integer)").unwrap();
        connection
    }

    fn count(connection: &Connection) -> i64 {
        connection
            .query_row("select count(*) from log", [], |r| r.get(0))
            .unwrap()
    }

    fn inserts(n: i64) -> Vec<BoundStatement> {
        (0..n)
            .map(|i| BoundStatement::new("insert into log values (?1)", vec![Value::Integer(i)]))
            .collect()
    }

    #[test]
    fn unwinders_run_once_on_exhaustion() {
        let connection = log_table();
        let mut cursor = Cursor::new(
            vec!["x".to_string()],
            vec![vec![Value::Integer(1)]],
            Unwind::new(&connection, inserts(2)),
        );
        assert!(cursor.next().is_some());
        assert_eq!(count(&connection), 0);
        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
        drop(cursor);
        assert_eq!(count(&connection), 2);
    }

    #[test]
    fn abandoning_a_cursor_unwinds() {
        let connection = log_table();
        let cursor = Cursor::new(
            vec!["x".to_string()],
            vec![vec![Value::Integer(1)], vec![Value::Integer(2)]],
            Unwind::new(&connection, inserts(3)),
        );
        drop(cursor);
        assert_eq!(count(&connection), 3);
    }

    #[test]
    fn unwinders_run_in_reverse() {
        let connection = log_table();
        Unwind::new(&connection, inserts(3)).run();
        let order: Vec<i64> = connection
            .prepare("select n from log order by rowid")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
