//! SQL scalar functions that compiled BQL calls into.
//!
//! Each function names a population, an optional generator (NULL for every
//! generator of the population) and an optional JSON array of model numbers
//! (NULL for every model). Per-model answers from the backends are pooled
//! into one ensemble answer here.

use std::sync::Arc;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{ToSql, Value};
use rusqlite::Connection;
use serde_json::json;
use tracing::trace;

use crate::backend::{Backend, Constraint, ModelScope};
use crate::catalog::{Catalog, Generator, is_numeric_stattype};
use crate::engine::Shared;
use crate::error::{BqlError, Result};
use crate::output::{quote_ident, render_float};
use crate::stats;

struct Member {
    generator: Generator,
    backend: Arc<dyn Backend>,
}

/// The generators and models one BQL primitive ranges over.
pub struct Ensemble<'c> {
    connection: &'c Connection,
    population_id: i64,
    members: Vec<Member>,
    modelnos: Option<Vec<u32>>,
}

impl<'c> Ensemble<'c> {
    pub fn new(
        connection: &'c Connection,
        shared: &Shared,
        population_id: i64,
        generator_id: Option<i64>,
        modelnos: Option<Vec<u32>>,
    ) -> Result<Ensemble<'c>> {
        let catalog = Catalog::new(connection, &shared.cache);
        let generators = match generator_id {
            Some(id) => {
                let generator = catalog.generator_by_id(id)?;
                if generator.population_id != population_id {
                    return Err(BqlError::catalog(format!(
                        "generator {} does not model population {}",
                        generator.name, population_id
                    )));
                }
                vec![generator]
            }
            None => catalog.generators_of(population_id)?,
        };
        if generators.is_empty() {
            let population = catalog.population_by_id(population_id)?;
            return Err(BqlError::backend(format!(
                "population {} has no generators",
                population.name
            )));
        }
        let mut members = Vec::with_capacity(generators.len());
        for generator in generators {
            if let Some(wanted) = &modelnos {
                let available = catalog.modelnos(generator.id)?;
                if let Some(missing) = wanted.iter().find(|m| !available.contains(m)) {
                    return Err(BqlError::backend(format!(
                        "generator {} has no model {}",
                        generator.name, missing
                    )));
                }
            }
            let backend = shared.registry.get(&generator.backend)?;
            members.push(Member { generator, backend });
        }
        Ok(Ensemble {
            connection,
            population_id,
            members,
            modelnos,
        })
    }

    fn scope(&self, member: &Member) -> ModelScope<'_> {
        ModelScope {
            population_id: self.population_id,
            generator_id: member.generator.id,
            modelnos: self.modelnos.as_deref(),
        }
    }

    /// Averages per-model values within each generator, then across them.
    fn mean_of_means(
        &self,
        mut per_model: impl FnMut(&Member, ModelScope<'_>) -> Result<Vec<f64>>,
    ) -> Result<f64> {
        let mut means = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let values = per_model(member, self.scope(member))?;
            let mean = stats::mean(&values).ok_or_else(|| {
                BqlError::backend(format!("generator {} has no models", member.generator.name))
            })?;
            means.push(mean);
        }
        stats::mean(&means).ok_or_else(|| BqlError::Invariant("empty ensemble".to_string()))
    }

    pub fn dependence_probability(&self, colno0: i64, colno1: i64) -> Result<f64> {
        if colno0 == colno1 {
            return Ok(1.0);
        }
        self.mean_of_means(|m, scope| {
            m.backend
                .column_dependence_probability(self.connection, scope, colno0, colno1)
        })
    }

    /// Per-model mutual information, grouped by generator.
    pub fn mutual_information_samples(
        &self,
        colnos0: &[i64],
        colnos1: &[i64],
        constraints: &[Constraint],
        nsamples: u32,
    ) -> Result<Vec<(i64, Vec<f64>)>> {
        let mut samples = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let values = member.backend.column_mutual_information(
                self.connection,
                self.scope(member),
                colnos0,
                colnos1,
                constraints,
                nsamples,
            )?;
            samples.push((member.generator.id, values));
        }
        Ok(samples)
    }

    pub fn mutual_information(
        &self,
        colnos0: &[i64],
        colnos1: &[i64],
        constraints: &[Constraint],
        nsamples: u32,
    ) -> Result<f64> {
        self.mean_of_means(|m, scope| {
            m.backend.column_mutual_information(
                self.connection,
                scope,
                colnos0,
                colnos1,
                constraints,
                nsamples,
            )
        })
    }

    pub fn similarity(&self, rowid: i64, target_rowid: i64, colnos: &[i64]) -> Result<f64> {
        self.mean_of_means(|m, scope| {
            m.backend
                .row_similarity(self.connection, scope, rowid, target_rowid, colnos)
        })
    }

    pub fn relevance(
        &self,
        rowid_target: i64,
        rowid_query: &[i64],
        hypotheticals: &[Vec<Constraint>],
        colno: i64,
    ) -> Result<f64> {
        self.mean_of_means(|m, scope| {
            m.backend.predictive_relevance(
                self.connection,
                scope,
                rowid_target,
                rowid_query,
                hypotheticals,
                colno,
            )
        })
    }

    /// Log density of `targets` given `constraints`. Generators are weighed
    /// by how well they explain the constraints.
    pub fn logpdf(
        &self,
        rowid: Option<i64>,
        targets: &[Constraint],
        constraints: &[Constraint],
    ) -> Result<f64> {
        let mut joint = Vec::with_capacity(self.members.len());
        let mut weights = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let scope = self.scope(member);
            let l = member
                .backend
                .logpdf_joint(self.connection, scope, rowid, targets, constraints)?;
            joint.push(l);
            if !constraints.is_empty() {
                weights.push(
                    member
                        .backend
                        .logpdf_joint(self.connection, scope, rowid, constraints, &[])?,
                );
            }
        }
        if constraints.is_empty() {
            return Ok(stats::logmeanexp(&joint));
        }
        let weighted: Vec<f64> = joint.iter().zip(&weights).map(|(l, w)| l + w).collect();
        Ok(stats::logsumexp(&weighted) - stats::logsumexp(&weights))
    }

    /// The prediction of whichever generator is most confident.
    pub fn predict(&self, rowid: i64, colno: i64, nsamples: u32) -> Result<(Value, f64)> {
        let mut best: Option<(Value, f64)> = None;
        for member in &self.members {
            let (value, confidence) = member.backend.predict_confidence(
                self.connection,
                self.scope(member),
                rowid,
                colno,
                nsamples,
            )?;
            if best.as_ref().is_none_or(|(_, c)| confidence > *c) {
                best = Some((value, confidence));
            }
        }
        best.ok_or_else(|| BqlError::Invariant("empty ensemble".to_string()))
    }

    /// Draws `nsamples` rows of `targets`, splitting the draws over the
    /// generators by their likelihood of the constraints.
    pub fn simulate(
        &self,
        rowid: Option<i64>,
        targets: &[i64],
        constraints: &[Constraint],
        nsamples: usize,
        accuracy: Option<u32>,
    ) -> Result<Vec<Vec<Value>>> {
        let weights = if constraints.is_empty() {
            vec![1.0; self.members.len()]
        } else {
            let mut logs = Vec::with_capacity(self.members.len());
            for member in &self.members {
                logs.push(member.backend.logpdf_joint(
                    self.connection,
                    self.scope(member),
                    rowid,
                    constraints,
                    &[],
                )?);
            }
            let max = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            logs.iter().map(|l| (l - max).exp()).collect()
        };
        let counts = stats::apportion(nsamples, &weights);
        let mut rows = Vec::with_capacity(nsamples);
        for (member, count) in self.members.iter().zip(counts) {
            if count == 0 {
                continue;
            }
            let drawn = member.backend.simulate_joint(
                self.connection,
                self.scope(member),
                rowid,
                targets,
                constraints,
                count,
                accuracy,
            )?;
            if drawn.len() != count || drawn.iter().any(|row| row.len() != targets.len()) {
                return Err(BqlError::backend(format!(
                    "generator {} returned {} samples of the wrong shape",
                    member.generator.name,
                    drawn.len()
                )));
            }
            rows.extend(drawn);
        }
        Ok(rows)
    }
}

// ----------------------------------------------------------- arguments

fn int_arg(ctx: &Context<'_>, i: usize) -> Result<i64> {
    Ok(ctx.get::<i64>(i)?)
}

fn opt_int_arg(ctx: &Context<'_>, i: usize) -> Result<Option<i64>> {
    Ok(ctx.get::<Option<i64>>(i)?)
}

fn value_arg(ctx: &Context<'_>, i: usize) -> Result<Value> {
    Ok(ctx.get::<Value>(i)?)
}

fn json_arg<T: serde::de::DeserializeOwned>(ctx: &Context<'_>, i: usize) -> Result<Option<T>> {
    match ctx.get::<Option<String>>(i)? {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn count_arg(ctx: &Context<'_>, i: usize, what: &str) -> Result<usize> {
    let n = int_arg(ctx, i)?;
    usize::try_from(n).map_err(|_| BqlError::Invariant(format!("negative {what} count: {n}")))
}

/// Reads `count` (column number, value) pairs starting at argument `start`.
fn pairs_arg(ctx: &Context<'_>, start: usize, count: usize) -> Result<Vec<Constraint>> {
    if start + 2 * count > ctx.len() {
        return Err(BqlError::Invariant(format!(
            "expected {count} column/value pairs from argument {start}, got {} arguments",
            ctx.len()
        )));
    }
    (0..count)
        .map(|k| Ok((int_arg(ctx, start + 2 * k)?, value_arg(ctx, start + 2 * k + 1)?)))
        .collect()
}

/// The leading population, generator and models arguments.
fn ensemble_arg<'c>(ctx: &Context<'_>, connection: &'c Connection, shared: &Shared) -> Result<Ensemble<'c>> {
    let population_id = int_arg(ctx, 0)?;
    let generator_id = opt_int_arg(ctx, 1)?;
    let modelnos: Option<Vec<u32>> = json_arg(ctx, 2)?;
    Ensemble::new(connection, shared, population_id, generator_id, modelnos)
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => json!(i),
        Value::Real(r) => json!(r),
        Value::Text(t) => json!(t),
        Value::Blob(b) => json!(b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
    }
}

pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map_or(Value::Null, Value::Real),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Real(r) => Some(*r),
        Value::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => render_float(*r),
        Value::Text(t) => t.clone(),
        Value::Blob(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
    }
}

// ------------------------------------------------------------ functions

fn dependence_probability(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<f64> {
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    ensemble.dependence_probability(int_arg(ctx, 3)?, int_arg(ctx, 4)?)
}

/// `(population, generator, models, colnos0, colnos1, nsamples, c, v, ...)`
fn mutual_information(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<f64> {
    if ctx.len() < 6 || (ctx.len() - 6) % 2 != 0 {
        return Err(BqlError::Invariant(format!(
            "bql_column_mutual_information got {} arguments",
            ctx.len()
        )));
    }
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let colnos0: Vec<i64> = json_arg(ctx, 3)?.unwrap_or_default();
    let colnos1: Vec<i64> = json_arg(ctx, 4)?.unwrap_or_default();
    let nsamples = sample_count(opt_int_arg(ctx, 5)?, shared.settings.mutinf_samples)?;
    let constraints = pairs_arg(ctx, 6, (ctx.len() - 6) / 2)?;
    ensemble.mutual_information(&colnos0, &colnos1, &constraints, nsamples)
}

/// `(population, colno0, colno1)`, computed from the data itself.
fn correlation(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Option<f64>> {
    let catalog = Catalog::new(connection, &shared.cache);
    let population = catalog.population_by_id(int_arg(ctx, 0)?)?;
    let mut variables = Vec::with_capacity(2);
    for i in [1, 2] {
        let colno = int_arg(ctx, i)?;
        let variable = catalog
            .variable_by_colno(population.id, None, colno)?
            .ok_or_else(|| {
                BqlError::compile(format!(
                    "correlation is only defined for modeled columns, not column {colno}"
                ))
            })?;
        variables.push(variable);
    }
    let (a, b) = (quote_ident(&variables[0].name), quote_ident(&variables[1].name));
    let sql = format!(
        "select {a}, {b} from {} where {a} is not null and {b} is not null",
        quote_ident(&population.table)
    );
    let mut statement = connection.prepare(&sql)?;
    let data = statement
        .query_map([], |r| Ok((r.get::<_, Value>(0)?, r.get::<_, Value>(1)?)))?
        .collect::<rusqlite::Result<Vec<(Value, Value)>>>()?;
    let numeric0 = is_numeric_stattype(&variables[0].stattype);
    let numeric1 = is_numeric_stattype(&variables[1].stattype);
    Ok(match (numeric0, numeric1) {
        (true, true) => {
            let pairs: Vec<(f64, f64)> = data
                .iter()
                .filter_map(|(x, y)| Some((value_number(x)?, value_number(y)?)))
                .collect();
            stats::pearson_r2(&pairs)
        }
        (false, false) => {
            let pairs: Vec<(String, String)> = data
                .iter()
                .map(|(x, y)| (value_label(x), value_label(y)))
                .collect();
            stats::cramer_phi(&pairs)
        }
        (false, true) => {
            let pairs: Vec<(String, f64)> = data
                .iter()
                .filter_map(|(g, y)| Some((value_label(g), value_number(y)?)))
                .collect();
            stats::anova_r2(&pairs)
        }
        (true, false) => {
            let pairs: Vec<(String, f64)> = data
                .iter()
                .filter_map(|(y, g)| Some((value_label(g), value_number(y)?)))
                .collect();
            stats::anova_r2(&pairs)
        }
    })
}

/// `(population, generator, models, rowid, ntargets, t, v, ..., c, v, ...)`
/// A NULL target value makes the density NULL. NULL constraints are ignored.
fn pdf_joint(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Option<f64>> {
    if ctx.len() < 5 {
        return Err(BqlError::Invariant(format!("bql_pdf_joint got {} arguments", ctx.len())));
    }
    let ntargets = count_arg(ctx, 4, "target")?;
    let rest = ctx.len() - 5;
    if rest < 2 * ntargets || (rest - 2 * ntargets) % 2 != 0 {
        return Err(BqlError::Invariant(format!(
            "bql_pdf_joint got {} arguments for {ntargets} targets",
            ctx.len()
        )));
    }
    let targets = pairs_arg(ctx, 5, ntargets)?;
    if targets.iter().any(|(_, v)| *v == Value::Null) {
        return Ok(None);
    }
    let constraints: Vec<Constraint> = pairs_arg(ctx, 5 + 2 * ntargets, (rest - 2 * ntargets) / 2)?
        .into_iter()
        .filter(|(_, v)| *v != Value::Null)
        .collect();
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let rowid = opt_int_arg(ctx, 3)?;
    Ok(Some(ensemble.logpdf(rowid, &targets, &constraints)?.exp()))
}

/// `(population, generator, models, rowid, target_rowid, colnos)`
fn row_similarity(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Option<f64>> {
    let (Some(rowid), Some(target)) = (opt_int_arg(ctx, 3)?, opt_int_arg(ctx, 4)?) else {
        return Ok(None);
    };
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let colnos: Vec<i64> = json_arg(ctx, 5)?.unwrap_or_default();
    Ok(Some(ensemble.similarity(rowid, target, &colnos)?))
}

/// `(population, generator, models, target_rowid, query_rowids, colno,
/// nhypothetical, [count, c, v, ...]...)`
fn row_predictive_relevance(
    ctx: &Context<'_>,
    connection: &Connection,
    shared: &Shared,
) -> Result<Option<f64>> {
    let Some(target) = opt_int_arg(ctx, 3)? else {
        return Ok(None);
    };
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let query: Vec<i64> = json_arg(ctx, 4)?.unwrap_or_default();
    let colno = int_arg(ctx, 5)?;
    let nhypothetical = count_arg(ctx, 6, "hypothetical row")?;
    let mut hypotheticals = Vec::with_capacity(nhypothetical);
    let mut at = 7;
    for _ in 0..nhypothetical {
        if at >= ctx.len() {
            return Err(BqlError::Invariant(
                "bql_row_predictive_relevance ran out of arguments".to_string(),
            ));
        }
        let count = count_arg(ctx, at, "hypothetical value")?;
        hypotheticals.push(pairs_arg(ctx, at + 1, count)?);
        at += 1 + 2 * count;
    }
    if at != ctx.len() {
        return Err(BqlError::Invariant(format!(
            "bql_row_predictive_relevance got {} extra arguments",
            ctx.len() - at
        )));
    }
    Ok(Some(ensemble.relevance(target, &query, &hypotheticals, colno)?))
}

/// A query's sample count, or `default` when it names none.
pub(crate) fn sample_count(requested: Option<i64>, default: u32) -> Result<u32> {
    match requested {
        None => Ok(default),
        Some(n) if n > 0 => {
            u32::try_from(n).map_err(|_| BqlError::Bind(format!("sample count {n} is too large")))
        }
        Some(n) => Err(BqlError::Bind(format!("sample count must be positive, got {n}"))),
    }
}

fn predict_samples(ctx: &Context<'_>, i: usize, shared: &Shared) -> Result<u32> {
    sample_count(opt_int_arg(ctx, i)?, shared.settings.predict_samples)
}

/// `(population, generator, models, colno, rowid, threshold, nsamples)`
fn predict(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Value> {
    let Some(rowid) = opt_int_arg(ctx, 4)? else {
        return Ok(Value::Null);
    };
    let threshold = ctx.get::<Option<f64>>(5)?.unwrap_or(0.0);
    let nsamples = predict_samples(ctx, 6, shared)?;
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let (value, confidence) = ensemble.predict(rowid, int_arg(ctx, 3)?, nsamples)?;
    Ok(if confidence >= threshold { value } else { Value::Null })
}

/// `(population, generator, models, colno, rowid, nsamples)`, answering a
/// JSON object with `value` and `confidence`.
fn predict_confidence(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Option<String>> {
    let Some(rowid) = opt_int_arg(ctx, 4)? else {
        return Ok(None);
    };
    let nsamples = predict_samples(ctx, 5, shared)?;
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let (value, confidence) = ensemble.predict(rowid, int_arg(ctx, 3)?, nsamples)?;
    Ok(Some(
        json!({ "value": value_to_json(&value), "confidence": confidence }).to_string(),
    ))
}

/// `(population, generator, models, colno)`: one draw of a variable, as
/// `SIMULATE x FROM MODELS OF p` asks once per model.
fn simulate_value(ctx: &Context<'_>, connection: &Connection, shared: &Shared) -> Result<Value> {
    let ensemble = ensemble_arg(ctx, connection, shared)?;
    let colno = int_arg(ctx, 3)?;
    let mut rows = ensemble.simulate(None, &[colno], &[], 1, shared.settings.simulate_accuracy)?;
    Ok(rows.pop().and_then(|mut row| row.pop()).unwrap_or(Value::Null))
}

fn json_get(ctx: &Context<'_>) -> Result<Value> {
    let Some(text) = ctx.get::<Option<String>>(0)? else {
        return Ok(Value::Null);
    };
    let key: String = ctx.get(1)?;
    let object: serde_json::Value = serde_json::from_str(&text)?;
    Ok(object.get(&key).map_or(Value::Null, json_to_value))
}

fn define<T, F>(connection: &Connection, shared: &Arc<Shared>, name: &'static str, n_arg: i32, body: F) -> Result<()>
where
    T: ToSql,
    F: Fn(&Context<'_>, &Connection, &Shared) -> Result<T> + Send + 'static,
{
    let shared = Arc::clone(shared);
    connection.create_scalar_function(name, n_arg, FunctionFlags::SQLITE_UTF8, move |ctx| {
        // SAFETY: the handle is only used for the duration of this call, on
        // the thread SQLite invoked us from.
        let connection = unsafe { ctx.get_connection()? };
        body(ctx, &connection, &shared).map_err(|e| {
            trace!(function = name, error = %e, "bql function failed");
            e.into()
        })
    })?;
    Ok(())
}

/// Registers every `bql_*` scalar function on `connection`.
pub fn register(connection: &Connection, shared: &Arc<Shared>) -> Result<()> {
    define(connection, shared, "bql_column_dependence_probability", 5, dependence_probability)?;
    define(connection, shared, "bql_column_mutual_information", -1, mutual_information)?;
    define(connection, shared, "bql_column_correlation", 3, correlation)?;
    define(connection, shared, "bql_pdf_joint", -1, pdf_joint)?;
    define(connection, shared, "bql_row_similarity", 6, row_similarity)?;
    define(connection, shared, "bql_row_predictive_relevance", -1, row_predictive_relevance)?;
    define(connection, shared, "bql_predict", 7, predict)?;
    define(connection, shared, "bql_predict_confidence", 6, predict_confidence)?;
    define(connection, shared, "bql_simulate_value", 4, simulate_value)?;
    connection.create_scalar_function(
        "bql_json_get",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| json_get(ctx).map_err(Into::into),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_convert_to_sql_values() {
        assert_eq!(json_to_value(&json!(3)), Value::Integer(3));
        assert_eq!(json_to_value(&json!(0.5)), Value::Real(0.5));
        assert_eq!(json_to_value(&json!("a")), Value::Text("a".to_string()));
        assert_eq!(json_to_value(&json!(null)), Value::Null);
        assert_eq!(value_to_json(&Value::Integer(7)), json!(7));
    }

    #[test]
    fn sample_counts_fit_or_fail() {
        assert_eq!(sample_count(None, 50).unwrap(), 50);
        assert_eq!(sample_count(Some(7), 50).unwrap(), 7);
        assert!(matches!(sample_count(Some(0), 50), Err(BqlError::Bind(_))));
        let huge = i64::from(u32::MAX) + 1;
        assert!(matches!(sample_count(Some(huge), 50), Err(BqlError::Bind(_))));
    }

    #[test]
    fn json_get_reads_one_key() {
        let connection = Connection::open_in_memory().unwrap();
        let shared = Arc::new(Shared::default());
        register(&connection, &shared).unwrap();
        let confidence: f64 = connection
            .query_row(
                "select bql_json_get('{\"value\": \"x\", \"confidence\": 0.25}', 'confidence')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(confidence, 0.25);
        let missing: Option<String> = connection
            .query_row("select bql_json_get(null, 'value')", [], |r| r.get(0))
            .unwrap();
        assert!(missing.is_none());
    }
}
