//! bqlite – a BQL to SQL compiler running on SQLite.
//!
//! BQL extends SQL with probabilistic queries over *populations*: named sets
//! of modeled variables drawn from one table. A *generator* binds a
//! population to an inference [`backend::Backend`] and owns numbered
//! *models*. Queries such as
//!
//! ```text
//! ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p;
//! SIMULATE x, y FROM p GIVEN z = 1 LIMIT 10;
//! INFER EXPLICIT PREDICT y CONFIDENCE c FROM p WHERE y IS NULL;
//! ```
//!
//! compile into plain SQL that calls `bql_*` scalar functions, which in turn
//! ask the registered backends and pool their per-model answers.
//!
//! ## Pipeline
//! * [`lexer`] and [`parser`] – tokens, the pest grammar and the phrase scanner.
//! * [`ast`] and [`macros`] – the syntax tree and the rewrites of compound forms.
//! * [`output`], [`context`] and [`compiler`] – SQL generation with parameter
//!   renumbering, arity-checked contexts and the winder/unwinder protocol.
//! * [`engine`] and [`cursor`] – phrase execution, catalog commands and result
//!   cursors.
//! * [`txn`] and [`cache`] – nested savepoints and the metadata cache they
//!   bracket.
//! * [`functions`], [`mutinf`] and [`stats`] – the SQL-side surface of the
//!   backends and ensemble aggregation.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use bqlite::engine::Bql;
//! # fn backend() -> Arc<dyn bqlite::backend::Backend> { unimplemented!() }
//! let bql = Bql::open_in_memory().unwrap();
//! bql.register_backend(backend()).unwrap();
//! bql.execute_script(
//!     "CREATE TABLE t AS SELECT 1.5 AS x, 'a' AS y;
//!      CREATE POPULATION p FOR t (x NUMERICAL; y NOMINAL);
//!      CREATE GENERATOR g FOR p;
//!      INITIALIZE 4 MODELS FOR g;
//!      ANALYZE g FOR 10 ITERATIONS;",
//! ).unwrap();
//! for row in bql.execute("ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p").unwrap() {
//!     println!("{row:?}");
//! }
//! ```

pub mod ast;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod context;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod functions;
pub mod guess;
pub mod lexer;
pub mod macros;
pub mod mutinf;
pub mod output;
pub mod parser;
pub mod stats;
pub mod txn;

pub use engine::Bql;
pub use error::{BqlError, Result};
pub use output::Bindings;

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Settings;

/// Installs a formatting subscriber filtered by `settings.log_filter`.
/// `RUST_LOG` wins when set. Returns false if a global subscriber was
/// already installed.
pub fn init_logging(settings: &Settings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_installs_once() {
        let settings = Settings::default();
        init_logging(&settings);
        assert!(!init_logging(&settings));
    }
}
