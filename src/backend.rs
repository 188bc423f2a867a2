//! Backend capability interface.
//!
//! A backend does the statistics: it fits models for a generator and answers
//! the per-model questions that BQL primitives ask. Every call names the
//! population and generator it concerns plus an optional model-number
//! filter, `None` meaning every model of the generator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use rusqlite::types::Value;

use crate::ast::SchemaToken;
use crate::error::{BqlError, Result};

/// A column number paired with the value it is fixed to.
pub type Constraint = (i64, Value);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelScope<'a> {
    pub population_id: i64,
    pub generator_id: i64,
    pub modelnos: Option<&'a [u32]>,
}

/// How long ANALYZE may run and how often it checkpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisBudget {
    pub iterations: Option<u64>,
    pub seconds: Option<u64>,
    pub checkpoint_iterations: Option<u64>,
    pub checkpoint_seconds: Option<u64>,
    pub wait: bool,
    pub program: Option<Vec<SchemaToken>>,
}

/// A variable a generator models without any base-table column behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentVariable {
    pub name: String,
    pub stattype: String,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the backend is registered with a connection.
    fn register(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// Sets up a new generator and returns the latent variables its schema
    /// declares, in the order they should be numbered.
    fn create_generator(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        schema: &[SchemaToken],
    ) -> Result<Vec<LatentVariable>>;

    fn drop_generator(&self, connection: &Connection, scope: ModelScope<'_>) -> Result<()>;

    fn rename_generator(
        &self,
        _connection: &Connection,
        _scope: ModelScope<'_>,
        _old: &str,
        _new: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Backend-specific ALTER GENERATOR commands, handed over verbatim.
    fn alter_generator(
        &self,
        _connection: &Connection,
        _scope: ModelScope<'_>,
        _commands: &[SchemaToken],
    ) -> Result<()> {
        Err(BqlError::backend(format!(
            "backend {} does not support ALTER GENERATOR",
            self.name()
        )))
    }

    fn initialize_models(&self, connection: &Connection, scope: ModelScope<'_>, modelnos: &[u32]) -> Result<()>;

    fn drop_models(&self, connection: &Connection, scope: ModelScope<'_>) -> Result<()>;

    fn analyze_models(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        budget: &AnalysisBudget,
    ) -> Result<()>;

    fn column_dependence_probability(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        colno0: i64,
        colno1: i64,
    ) -> Result<Vec<f64>>;

    #[allow(clippy::too_many_arguments)]
    fn column_mutual_information(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        colnos0: &[i64],
        colnos1: &[i64],
        constraints: &[Constraint],
        nsamples: u32,
    ) -> Result<Vec<f64>>;

    fn row_similarity(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid: i64,
        target_rowid: i64,
        colnos: &[i64],
    ) -> Result<Vec<f64>>;

    fn predictive_relevance(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid_target: i64,
        rowid_query: &[i64],
        hypotheticals: &[Vec<Constraint>],
        colno: i64,
    ) -> Result<Vec<f64>>;

    /// The most likely value of `colno` in row `rowid`, with a confidence.
    fn predict_confidence(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid: i64,
        colno: i64,
        nsamples: u32,
    ) -> Result<(Value, f64)>;

    #[allow(clippy::too_many_arguments)]
    fn simulate_joint(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid: Option<i64>,
        targets: &[i64],
        constraints: &[Constraint],
        nsamples: usize,
        accuracy: Option<u32>,
    ) -> Result<Vec<Vec<Value>>>;

    fn logpdf_joint(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid: Option<i64>,
        targets: &[Constraint],
        constraints: &[Constraint],
    ) -> Result<f64>;
}

/// Backends by name, shared between the engine and the SQL functions.
#[derive(Default)]
pub struct Registry {
    backends: Mutex<HashMap<String, Arc<dyn Backend>>>,
}

impl Registry {
    pub fn insert(&self, backend: Arc<dyn Backend>) {
        let mut backends = self
            .backends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let backends = self
            .backends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backends
            .get(name)
            .cloned()
            .ok_or_else(|| BqlError::backend(format!("no backend named {name} is registered")))
    }

    pub fn names(&self) -> Vec<String> {
        let backends = self
            .backends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = backends.keys().cloned().collect();
        names.sort();
        names
    }
}
