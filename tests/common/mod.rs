#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bqlite::ast::SchemaToken;
use bqlite::backend::{AnalysisBudget, Backend, Constraint, LatentVariable, ModelScope};
use bqlite::engine::Bql;
use bqlite::error::{BqlError, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params};

/// A backend whose answers are fixed functions of its arguments, so tests
/// can predict every result. Calls are recorded for inspection.
#[derive(Default)]
pub struct ScriptedBackend {
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn models(&self, connection: &Connection, scope: ModelScope<'_>) -> Result<Vec<u32>> {
        if let Some(modelnos) = scope.modelnos {
            return Ok(modelnos.to_vec());
        }
        let mut statement = connection
            .prepare("select modelno from bql_model where generator_id = ? order by modelno")?;
        let modelnos = statement
            .query_map(params![scope.generator_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<u32>>>()?;
        Ok(modelnos)
    }
}

fn mentions_fail(tokens: &[SchemaToken]) -> bool {
    tokens.iter().any(|t| match t {
        SchemaToken::Word(w) => w.eq_ignore_ascii_case("fail"),
        SchemaToken::Group(inner) => mentions_fail(inner),
        _ => false,
    })
}

fn flatten(tokens: &[SchemaToken], into: &mut Vec<SchemaToken>) {
    for token in tokens {
        match token {
            SchemaToken::Group(inner) => flatten(inner, into),
            other => into.push(other.clone()),
        }
    }
}

/// `LATENT name stattype` anywhere in the schema declares a latent variable.
fn declared_latents(schema: &[SchemaToken]) -> Vec<LatentVariable> {
    let mut tokens = Vec::new();
    flatten(schema, &mut tokens);
    tokens
        .windows(3)
        .filter_map(|w| match w {
            [SchemaToken::Word(kw), SchemaToken::Word(name), SchemaToken::Word(stattype)]
                if kw.eq_ignore_ascii_case("latent") =>
            {
                Some(LatentVariable {
                    name: name.clone(),
                    stattype: stattype.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create_generator(
        &self,
        _connection: &Connection,
        scope: ModelScope<'_>,
        schema: &[SchemaToken],
    ) -> Result<Vec<LatentVariable>> {
        if mentions_fail(schema) {
            return Err(BqlError::backend("scripted backend rejects this schema"));
        }
        self.record(format!("create {}", scope.generator_id));
        Ok(declared_latents(schema))
    }

    fn drop_generator(&self, _connection: &Connection, scope: ModelScope<'_>) -> Result<()> {
        self.record(format!("drop {}", scope.generator_id));
        Ok(())
    }

    fn rename_generator(&self, _connection: &Connection, _scope: ModelScope<'_>, old: &str, new: &str) -> Result<()> {
        self.record(format!("rename {old} {new}"));
        Ok(())
    }

    fn initialize_models(&self, _connection: &Connection, scope: ModelScope<'_>, modelnos: &[u32]) -> Result<()> {
        self.record(format!("initialize {} {modelnos:?}", scope.generator_id));
        Ok(())
    }

    fn drop_models(&self, _connection: &Connection, scope: ModelScope<'_>) -> Result<()> {
        self.record(format!("drop models {} {:?}", scope.generator_id, scope.modelnos));
        Ok(())
    }

    fn analyze_models(&self, _connection: &Connection, scope: ModelScope<'_>, budget: &AnalysisBudget) -> Result<()> {
        self.record(format!(
            "analyze {} {:?} {:?} {:?}",
            scope.generator_id, scope.modelnos, budget.iterations, budget.seconds
        ));
        Ok(())
    }

    /// 0.5 for model 0, rising by 0.1 per model number.
    fn column_dependence_probability(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        _colno0: i64,
        _colno1: i64,
    ) -> Result<Vec<f64>> {
        Ok(self
            .models(connection, scope)?
            .into_iter()
            .map(|m| 0.5 + 0.1 * m as f64)
            .collect())
    }

    fn column_mutual_information(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        colnos0: &[i64],
        colnos1: &[i64],
        constraints: &[Constraint],
        _nsamples: u32,
    ) -> Result<Vec<f64>> {
        let base = 0.1 * (colnos0.len() + colnos1.len()) as f64 + 0.01 * constraints.len() as f64;
        Ok(self
            .models(connection, scope)?
            .into_iter()
            .map(|m| base + m as f64)
            .collect())
    }

    fn row_similarity(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        rowid: i64,
        target_rowid: i64,
        _colnos: &[i64],
    ) -> Result<Vec<f64>> {
        let similarity = 1.0 / (1.0 + (rowid - target_rowid).abs() as f64);
        Ok(vec![similarity; self.models(connection, scope)?.len()])
    }

    fn predictive_relevance(
        &self,
        connection: &Connection,
        scope: ModelScope<'_>,
        _rowid_target: i64,
        rowid_query: &[i64],
        hypotheticals: &[Vec<Constraint>],
        _colno: i64,
    ) -> Result<Vec<f64>> {
        let relevance = (rowid_query.len() + hypotheticals.len()) as f64;
        Ok(vec![relevance; self.models(connection, scope)?.len()])
    }

    fn predict_confidence(
        &self,
        _connection: &Connection,
        _scope: ModelScope<'_>,
        _rowid: i64,
        colno: i64,
        _nsamples: u32,
    ) -> Result<(Value, f64)> {
        Ok((Value::Real(100.0 + colno as f64), 0.75))
    }

    /// Draw `i` of target `colno` is `i + 10 * colno`.
    fn simulate_joint(
        &self,
        _connection: &Connection,
        _scope: ModelScope<'_>,
        _rowid: Option<i64>,
        targets: &[i64],
        _constraints: &[Constraint],
        nsamples: usize,
        _accuracy: Option<u32>,
    ) -> Result<Vec<Vec<Value>>> {
        Ok((0..nsamples)
            .map(|i| {
                targets
                    .iter()
                    .map(|colno| Value::Integer(i as i64 + 10 * colno))
                    .collect()
            })
            .collect())
    }

    fn logpdf_joint(
        &self,
        _connection: &Connection,
        _scope: ModelScope<'_>,
        _rowid: Option<i64>,
        targets: &[Constraint],
        _constraints: &[Constraint],
    ) -> Result<f64> {
        Ok(-(targets.len() as f64))
    }
}

/// A session with table `t(x, y, z)`, population `p` modeling `x` and `y`,
/// and generator `g` with `models` models.
pub fn setup(models: u32) -> (Bql, Arc<ScriptedBackend>) {
    let bql = Bql::open_in_memory().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    bql.register_backend(backend.clone()).unwrap();
    bql.sql_execute(
        "create table t (x real, y text, z integer);
         insert into t values (1.0, 'a', 1), (2.0, 'b', 2), (3.0, 'a', 3), (null, 'b', 4);",
    )
    .unwrap();
    bql.execute_script(&format!(
        "CREATE POPULATION p FOR t (x NUMERICAL; y NOMINAL; IGNORE z);
         CREATE GENERATOR g FOR p USING scripted;
         INITIALIZE {models} MODELS FOR g;"
    ))
    .unwrap();
    (bql, backend)
}

pub fn temp_tables(bql: &Bql) -> Vec<String> {
    bql.catalog().temp_table_names().unwrap()
}
