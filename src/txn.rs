//! Nested transactions and savepoints.
//!
//! Scopes nest strictly. The outermost scope, whether an explicit BEGIN or
//! an implicit savepoint, opens the metadata cache and closes it on exit,
//! on commit and rollback alike.

use std::cell::Cell;

use rusqlite::Connection;
use tracing::{trace, warn};

use crate::cache::CacheSlot;
use crate::error::{BqlError, Result};

#[derive(Debug, Default)]
pub struct Transactions {
    depth: Cell<usize>,
    explicit: Cell<bool>,
    counter: Cell<u64>,
}

impl Transactions {
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn in_transaction(&self) -> bool {
        self.explicit.get()
    }

    fn enter(&self, cache: &CacheSlot) {
        if self.depth.get() == 0 {
            cache.begin();
        }
        self.depth.set(self.depth.get() + 1);
    }

    fn leave(&self, cache: &CacheSlot) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            cache.end();
        }
    }

    /// `BEGIN`: only legal when no scope is open.
    pub fn begin(&self, connection: &Connection, cache: &CacheSlot) -> Result<()> {
        if self.depth.get() > 0 {
            return Err(BqlError::Transaction(
                "already in a transaction; use savepoints to nest".to_string(),
            ));
        }
        self.enter(cache);
        if let Err(e) = connection.execute_batch("BEGIN") {
            self.leave(cache);
            return Err(e.into());
        }
        self.explicit.set(true);
        trace!("transaction begun");
        Ok(())
    }

    pub fn commit(&self, connection: &Connection, cache: &CacheSlot) -> Result<()> {
        self.require_explicit("COMMIT")?;
        connection.execute_batch("COMMIT")?;
        self.explicit.set(false);
        self.leave(cache);
        trace!("transaction committed");
        Ok(())
    }

    pub fn rollback(&self, connection: &Connection, cache: &CacheSlot) -> Result<()> {
        self.require_explicit("ROLLBACK")?;
        let outcome = connection.execute_batch("ROLLBACK");
        self.explicit.set(false);
        cache.invalidate();
        self.leave(cache);
        trace!("transaction rolled back");
        outcome.map_err(Into::into)
    }

    fn require_explicit(&self, what: &str) -> Result<()> {
        if !self.explicit.get() {
            return Err(BqlError::Transaction(format!("{what} without BEGIN")));
        }
        if self.depth.get() != 1 {
            return Err(BqlError::Transaction(format!(
                "{what} while a savepoint is still open"
            )));
        }
        Ok(())
    }

    /// Opens a savepoint that rolls back unless committed.
    pub fn savepoint<'c>(&'c self, connection: &'c Connection, cache: &'c CacheSlot) -> Result<Savepoint<'c>> {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        let name = format!("bql_sp_{n}");
        self.enter(cache);
        if let Err(e) = connection.execute_batch(&format!("SAVEPOINT {name}")) {
            self.leave(cache);
            return Err(e.into());
        }
        trace!(savepoint = %name, depth = self.depth.get(), "savepoint opened");
        Ok(Savepoint {
            connection,
            cache,
            transactions: self,
            name,
            finished: false,
        })
    }
}

/// A scoped savepoint. Dropping it without [`Savepoint::commit`] rolls back.
pub struct Savepoint<'c> {
    connection: &'c Connection,
    cache: &'c CacheSlot,
    transactions: &'c Transactions,
    name: String,
    finished: bool,
}

impl Savepoint<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let outcome = self
            .connection
            .execute_batch(&format!("RELEASE SAVEPOINT {}", self.name));
        if outcome.is_err() {
            if let Err(e) = self.undo() {
                warn!(error = %e, savepoint = %self.name, "could not roll back savepoint");
            }
        }
        self.transactions.leave(self.cache);
        trace!(savepoint = %self.name, "savepoint released");
        outcome.map_err(Into::into)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let outcome = self.undo();
        self.transactions.leave(self.cache);
        outcome
    }

    fn undo(&self) -> Result<()> {
        self.cache.invalidate();
        self.connection.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
            self.name
        ))?;
        trace!(savepoint = %self.name, "savepoint rolled back");
        Ok(())
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.undo() {
            warn!(error = %e, savepoint = %self.name, "could not roll back savepoint");
        }
        self.transactions.leave(self.cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Connection, CacheSlot, Transactions) {
        let connection = Connection::open_in_memory().unwrap();
        connection.execute_batch("create table t (x)").unwrap();
        (connection, CacheSlot::default(), Transactions::default())
    }

    fn count(connection: &Connection) -> i64 {
        connection
            .query_row("select count(*) from t", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn dropped_savepoint_rolls_back() {
        let (connection, cache, txns) = setup();
        {
            let _sp = txns.savepoint(&connection, &cache).unwrap();
            assert!(cache.is_active());
            connection.execute("insert into t values (1)", []).unwrap();
        }
        assert_eq!(count(&connection), 0);
        assert!(!cache.is_active());
        assert_eq!(txns.depth(), 0);
    }

    #[test]
    fn nested_savepoints_keep_one_cache() {
        let (connection, cache, txns) = setup();
        let outer = txns.savepoint(&connection, &cache).unwrap();
        connection.execute("insert into t values (1)", []).unwrap();
        let inner = txns.savepoint(&connection, &cache).unwrap();
        connection.execute("insert into t values (2)", []).unwrap();
        inner.rollback().unwrap();
        assert!(cache.is_active());
        outer.commit().unwrap();
        assert!(!cache.is_active());
        assert_eq!(count(&connection), 1);
    }

    #[test]
    fn begin_does_not_nest() {
        let (connection, cache, txns) = setup();
        txns.begin(&connection, &cache).unwrap();
        assert!(txns.begin(&connection, &cache).is_err());
        connection.execute("insert into t values (1)", []).unwrap();
        txns.rollback(&connection, &cache).unwrap();
        assert_eq!(count(&connection), 0);
        assert!(txns.commit(&connection, &cache).is_err());
    }
}
